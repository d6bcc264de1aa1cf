use std::{convert::TryFrom, fmt::Debug, sync::Arc};

use chrono::{FixedOffset, Local, Offset};
use reqwest::Url;

use crate::{
    error::{FetchError, ParseError},
    model::{Position, WeatherRecord},
    provider::{
        ambient::AmbientAdapter, openweather::OpenWeatherAdapter,
        pirateweather::PirateWeatherAdapter, wunderground::WundergroundAdapter,
    },
    store::ScheduleMetadata,
};

pub mod ambient;
pub mod openweather;
pub mod pirateweather;
pub mod wunderground;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenWeather,
    PirateWeather,
    Wunderground,
    Ambient,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeather => "openweather",
            ProviderId::PirateWeather => "pirateweather",
            ProviderId::Wunderground => "wunderground",
            ProviderId::Ambient => "ambient",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[
            ProviderId::OpenWeather,
            ProviderId::PirateWeather,
            ProviderId::Wunderground,
            ProviderId::Ambient,
        ]
    }

    /// Refresh interval used when none was stored for the provider.
    pub fn default_interval_secs(&self) -> u64 {
        match self {
            ProviderId::Ambient => 15 * 60,
            _ => 2 * 60 * 60,
        }
    }

    pub fn flex_secs(&self) -> u64 {
        match self {
            ProviderId::Ambient => 5 * 60,
            _ => 30 * 60,
        }
    }

    /// The on-device snapshot provider is the only one that needs no key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderId::Ambient)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(ProviderId::OpenWeather),
            "pirateweather" => Ok(ProviderId::PirateWeather),
            "wunderground" => Ok(ProviderId::Wunderground),
            "ambient" => Ok(ProviderId::Ambient),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: openweather, pirateweather, wunderground, ambient."
            )),
        }
    }
}

/// Provider-specific half of a refresh: how to ask, and how to read the answer.
///
/// Both operations are pure. `parse` writes only the fields the provider
/// supplies into a record seeded from the previously persisted state.
pub trait ProviderAdapter: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    fn build_request(
        &self,
        position: &Position,
        metadata: &ScheduleMetadata,
    ) -> Result<Url, FetchError>;

    fn parse(&self, body: &str, record: &mut WeatherRecord) -> Result<(), ParseError>;
}

/// Construct the adapter for `id`, converting sun times into `offset`.
pub fn adapter_for(id: ProviderId, offset: FixedOffset) -> Arc<dyn ProviderAdapter> {
    match id {
        ProviderId::OpenWeather => Arc::new(OpenWeatherAdapter::new().with_offset(offset)),
        ProviderId::PirateWeather => Arc::new(PirateWeatherAdapter::new().with_offset(offset)),
        ProviderId::Wunderground => Arc::new(WundergroundAdapter::new()),
        ProviderId::Ambient => Arc::new(AmbientAdapter::new()),
    }
}

/// The machine's current UTC offset.
pub fn local_offset() -> FixedOffset {
    Local::now().offset().fix()
}

pub(crate) fn required_api_key(
    id: ProviderId,
    metadata: &ScheduleMetadata,
) -> Result<&str, FetchError> {
    metadata
        .api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or(FetchError::MissingApiKey(id.as_str()))
}

pub(crate) fn parse_base(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))
}
