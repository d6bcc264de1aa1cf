use reqwest::Url;
use serde::Deserialize;

use crate::{
    error::{FetchError, ParseError},
    model::{Condition, Position, WeatherRecord},
    store::ScheduleMetadata,
};

use super::{parse_base, required_api_key, ProviderAdapter, ProviderId};

const BASE_URL: &str = "http://api.wunderground.com/api";

/// Weather Underground geolookup + conditions. Supplies condition and
/// temperature only.
#[derive(Debug, Clone)]
pub struct WundergroundAdapter {
    base_url: String,
}

impl WundergroundAdapter {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for WundergroundAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WuObservation {
    weather: String,
    temp_c: f64,
}

#[derive(Debug, Deserialize)]
struct WuConditionsResponse {
    current_observation: WuObservation,
}

impl ProviderAdapter for WundergroundAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Wunderground
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
            .extend([api_key, "geolookup", "conditions", "q"])
            .push(&format!("{},{}.json", position.latitude, position.longitude));
        Ok(url)
    }

    fn parse(&self, body: &str, record: &mut WeatherRecord) -> Result<(), ParseError> {
        let parsed: WuConditionsResponse = serde_json::from_str(body)?;
        let observation = parsed.current_observation;

        record.set_condition(Condition::from_description(&observation.weather));
        record.set_celsius(observation.temp_c as f32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeOfDay;
    use chrono::{DateTime, Utc};

    #[test]
    fn request_path_matches_the_conditions_endpoint() {
        let meta = ScheduleMetadata {
            api_key: Some("WU".into()),
            ..Default::default()
        };
        let position = Position::new(37.77, -122.42, DateTime::<Utc>::default());
        let url = WundergroundAdapter::new()
            .build_request(&position, &meta)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://api.wunderground.com/api/WU/geolookup/conditions/q/37.77,-122.42.json"
        );
    }

    #[test]
    fn parses_condition_and_temperature_only() {
        let body = r#"{
            "location": {"city": "San Francisco"},
            "current_observation": {"weather": "Mostly Cloudy", "temp_c": 14.2, "wind_kph": 22}
        }"#;
        let mut record = WeatherRecord::default();
        record.set_wind_kph(9);
        record.set_sunset(TimeOfDay::new(20, 1).unwrap());

        WundergroundAdapter::new().parse(body, &mut record).unwrap();

        assert_eq!(record.condition(), Condition::Cloudy);
        assert!((record.celsius() - 14.2).abs() < 1e-4);
        assert_eq!(record.wind_kph(), 9);
        assert_eq!(record.sunset(), TimeOfDay::new(20, 1).unwrap());
    }

    #[test]
    fn missing_observation_is_a_parse_error() {
        let mut record = WeatherRecord::default();
        let err = WundergroundAdapter::new()
            .parse(r#"{"response": {"error": {"type": "keynotfound"}}}"#, &mut record)
            .unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }
}
