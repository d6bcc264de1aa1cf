use chrono::FixedOffset;
use reqwest::Url;
use serde::Deserialize;

use crate::{
    error::{FetchError, ParseError},
    model::{Condition, Position, TimeOfDay, WeatherRecord},
    store::ScheduleMetadata,
};

use super::{local_offset, parse_base, required_api_key, ProviderAdapter, ProviderId};

const BASE_URL: &str = "http://api.openweathermap.org/data/2.5/weather";

/// Offset between Kelvin and the Celsius value we store. Not 273.15; stored
/// records have always been computed this way.
const KELVIN_OFFSET: f64 = 273.0;

#[derive(Debug, Clone)]
pub struct OpenWeatherAdapter {
    base_url: String,
    offset: FixedOffset,
}

impl OpenWeatherAdapter {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            offset: local_offset(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }
}

impl Default for OpenWeatherAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    main: String,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct OwSys {
    sunrise: i64,
    sunset: i64,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    sys: OwSys,
}

impl ProviderAdapter for OpenWeatherAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    fn build_request(
        &self,
        position: &Position,
        metadata: &ScheduleMetadata,
    ) -> Result<Url, FetchError> {
        let api_key = required_api_key(self.id(), metadata)?;
        let mut url = parse_base(&self.base_url)?;
        url.query_pairs_mut()
            .append_pair("lat", &position.latitude.to_string())
            .append_pair("lon", &position.longitude.to_string())
            .append_pair("appid", api_key);
        Ok(url)
    }

    fn parse(&self, body: &str, record: &mut WeatherRecord) -> Result<(), ParseError> {
        let parsed: OwCurrentResponse = serde_json::from_str(body)?;

        let condition = parsed
            .weather
            .first()
            .map(|w| Condition::from_description(&w.main))
            .ok_or(ParseError::MissingField("weather[0].main"))?;
        let sunrise = TimeOfDay::from_unix_seconds(parsed.sys.sunrise, self.offset).ok_or(
            ParseError::OutOfRange {
                field: "sys.sunrise",
                value: parsed.sys.sunrise,
            },
        )?;
        let sunset = TimeOfDay::from_unix_seconds(parsed.sys.sunset, self.offset).ok_or(
            ParseError::OutOfRange {
                field: "sys.sunset",
                value: parsed.sys.sunset,
            },
        )?;

        record.set_condition(condition);
        record.set_celsius((parsed.main.temp - KELVIN_OFFSET) as f32);
        record.set_wind_kph(parsed.wind.speed as i32);
        record.set_sunrise(sunrise);
        record.set_sunset(sunset);
        Ok(())
    }
}
