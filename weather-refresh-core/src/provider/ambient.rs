//! On-device weather snapshot.
//!
//! There is no HTTP endpoint here. The adapter builds an `ambient:snapshot`
//! URL, and [`SnapshotFetcher`] answers it from a [`SnapshotSource`] by
//! serializing the snapshot to JSON, so the pipeline runs unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    error::{FetchError, ParseError},
    fetch::Fetcher,
    model::{Condition, Position, WeatherRecord},
    store::ScheduleMetadata,
};

use super::{ProviderAdapter, ProviderId};

const SCHEME: &str = "ambient";
const SNAPSHOT_URL: &str = "ambient:snapshot";

/// Condition flags reported by the on-device sensor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientCondition {
    Clear,
    Cloudy,
    Foggy,
    Hazy,
    Icy,
    Rainy,
    Snowy,
    Stormy,
    Windy,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbientSnapshot {
    pub temperature_celsius: f32,
    #[serde(default)]
    pub conditions: Vec<AmbientCondition>,
}

impl AmbientSnapshot {
    /// Sunny unless a flag says otherwise; the last mapped flag wins.
    pub fn condition(&self) -> Condition {
        self.conditions
            .iter()
            .fold(Condition::Sunny, |current, flag| match flag {
                AmbientCondition::Rainy | AmbientCondition::Stormy => Condition::Rain,
                AmbientCondition::Snowy => Condition::Snow,
                AmbientCondition::Cloudy => Condition::Cloudy,
                _ => current,
            })
    }
}

/// Where snapshots come from (a sensor daemon, a platform API, a file).
#[async_trait]
pub trait SnapshotSource: Send + Sync + std::fmt::Debug {
    async fn snapshot(&self, latitude: f64, longitude: f64) -> Result<AmbientSnapshot, FetchError>;
}

/// Reads the latest snapshot a local sensor daemon wrote to disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn snapshot(&self, _latitude: f64, _longitude: f64) -> Result<AmbientSnapshot, FetchError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Snapshot(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| FetchError::Snapshot(format!("{}: {e}", self.path.display())))
    }
}

/// Serves `ambient:` URLs from a [`SnapshotSource`].
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotFetcher {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Fetcher for SnapshotFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<String, FetchError> {
        if url.scheme() != SCHEME {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        let coordinate = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.parse::<f64>().ok())
                .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))
        };
        let (latitude, longitude) = (coordinate("lat")?, coordinate("lon")?);

        let snapshot = tokio::time::timeout(timeout, self.source.snapshot(latitude, longitude))
            .await
            .map_err(|_| FetchError::Timeout)??;
        serde_json::to_string(&snapshot).map_err(|e| FetchError::Snapshot(e.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AmbientAdapter;

impl AmbientAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderAdapter for AmbientAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Ambient
    }

    fn build_request(
        &self,
        position: &Position,
        _metadata: &ScheduleMetadata,
    ) -> Result<Url, FetchError> {
        Url::parse_with_params(
            SNAPSHOT_URL,
            &[
                ("lat", position.latitude.to_string()),
                ("lon", position.longitude.to_string()),
            ],
        )
        .map_err(|e| FetchError::InvalidUrl(e.to_string()))
    }

    fn parse(&self, body: &str, record: &mut WeatherRecord) -> Result<(), ParseError> {
        let snapshot: AmbientSnapshot = serde_json::from_str(body)?;
        record.set_celsius(snapshot.temperature_celsius);
        record.set_condition(snapshot.condition());
        Ok(())
    }
}
