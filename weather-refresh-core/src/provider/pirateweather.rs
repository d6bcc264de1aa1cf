use chrono::FixedOffset;
use reqwest::Url;
use serde::Deserialize;

use crate::{
    error::{FetchError, ParseError},
    model::{Condition, MoonPhase, Position, TimeOfDay, WeatherRecord},
    store::ScheduleMetadata,
};

use super::{local_offset, parse_base, required_api_key, ProviderAdapter, ProviderId};

const BASE_URL: &str = "https://api.pirateweather.net/forecast";
const QUERY: &str = "units=si&exclude=minutely,hourly,alerts";

/// Pirate Weather forecast API. Celsius-native; also supplies sun times and
/// the moon phase when the daily block is present.
#[derive(Debug, Clone)]
pub struct PirateWeatherAdapter {
    base_url: String,
    offset: FixedOffset,
}

impl PirateWeatherAdapter {
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

impl Default for PirateWeatherAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PwCurrently {
    summary: String,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PwDay {
    sunrise_time: i64,
    sunset_time: i64,
    moon_phase: f64,
}

#[derive(Debug, Deserialize)]
struct PwDaily {
    data: Vec<PwDay>,
}

#[derive(Debug, Deserialize)]
struct PwForecastResponse {
    currently: Option<PwCurrently>,
    daily: Option<PwDaily>,
}

impl ProviderAdapter for PirateWeatherAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::PirateWeather
    }

    fn build_request(
        &self,
        position: &Position,
        metadata: &ScheduleMetadata,
    ) -> Result<Url, FetchError> {
        let api_key = required_api_key(self.id(), metadata)?;
        let mut url = parse_base(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(api_key)
            .push(&format!("{},{}", position.latitude, position.longitude));
        url.set_query(Some(QUERY));
        Ok(url)
    }

    fn parse(&self, body: &str, record: &mut WeatherRecord) -> Result<(), ParseError> {
        let parsed: PwForecastResponse = serde_json::from_str(body)?;
        if parsed.currently.is_none() && parsed.daily.is_none() {
            return Err(ParseError::MissingField("currently|daily"));
        }

        let astronomy = match &parsed.daily {
            Some(daily) => {
                let today = daily
                    .data
                    .first()
                    .ok_or(ParseError::MissingField("daily.data[0]"))?;
                let sunrise = TimeOfDay::from_unix_seconds(today.sunrise_time, self.offset)
                    .ok_or(ParseError::OutOfRange {
                        field: "daily.data[0].sunriseTime",
                        value: today.sunrise_time,
                    })?;
                let sunset = TimeOfDay::from_unix_seconds(today.sunset_time, self.offset).ok_or(
                    ParseError::OutOfRange {
                        field: "daily.data[0].sunsetTime",
                        value: today.sunset_time,
                    },
                )?;
                Some((MoonPhase::from_fraction(today.moon_phase), sunrise, sunset))
            }
            None => None,
        };

        if let Some(currently) = &parsed.currently {
            record.set_condition(Condition::from_description(&currently.summary));
            record.set_celsius(currently.temperature as f32);
            tracing::debug!(condition = %record.condition(), celsius = record.celsius(), "current conditions parsed");
        }
        if let Some((moon_phase, sunrise, sunset)) = astronomy {
            record.set_moon_phase(moon_phase);
            record.set_sunrise(sunrise);
            record.set_sunset(sunset);
            tracing::debug!(%moon_phase, %sunrise, %sunset, "astronomy parsed");
        }
        Ok(())
    }
}
