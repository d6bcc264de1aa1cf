use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::location::{Priority, DEFAULT_LOCATION_TIMEOUT, DEFAULT_MAX_STALENESS_SECS};
use crate::provider::ProviderId;

/// Per-provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Overrides the provider's default refresh interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_secs: Option<u64>,
}

/// Fixed device position; there is no location hardware on a desktop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_location_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub priority: Priority,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            max_staleness_secs: default_max_staleness_secs(),
            timeout_secs: default_location_timeout_secs(),
            priority: Priority::default(),
        }
    }
}

impl LocationConfig {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_network_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_network_timeout_secs(),
            read_timeout_secs: default_network_timeout_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_lapse_multiplier")]
    pub lapse_multiplier: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            lapse_multiplier: default_lapse_multiplier(),
        }
    }
}

/// Where the on-device sensor daemon drops its snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmbientConfig {
    pub snapshot_path: Option<PathBuf>,
}

fn default_max_staleness_secs() -> u64 {
    DEFAULT_MAX_STALENESS_SECS
}

fn default_location_timeout_secs() -> u64 {
    DEFAULT_LOCATION_TIMEOUT.as_secs()
}

fn default_network_timeout_secs() -> u64 {
    crate::fetch::DEFAULT_READ_TIMEOUT.as_secs()
}

fn default_lapse_multiplier() -> u32 {
    crate::controller::DEFAULT_LAPSE_MULTIPLIER
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Optional default provider id, e.g. "openweather" or "pirateweather".
    pub default_provider: Option<String>,

    /// Where refreshed records and schedule state live. Defaults to the
    /// platform data directory.
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub location: LocationConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub ambient: AmbientConfig,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow!(
                "No default provider configured.\n\
                 Hint: run `weather-refresh configure <provider>` (e.g. `weather-refresh configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    /// `explicit` if given, otherwise the configured default.
    pub fn resolve_provider(&self, explicit: Option<&str>) -> Result<ProviderId> {
        match explicit {
            Some(name) => ProviderId::try_from(name),
            None => self.default_provider_id(),
        }
    }

    pub fn provider_config(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id.as_str())
    }

    /// Store default provider as string.
    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// Load config from the platform location, or an empty default on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to the platform location, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weather-refresh", "weather-refresh")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory holding one state file per provider.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("state")),
        }
    }

    /// Convenience helper: set/replace a provider API key and optionally set default provider.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers
            .entry(provider_id.as_str().to_string())
            .or_default()
            .api_key = Some(api_key);

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    /// Returns API key for a provider, if present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.provider_config(provider_id)
            .and_then(|cfg| cfg.api_key.as_deref())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        !provider_id.requires_api_key() || self.provider_api_key(provider_id).is_some()
    }

    /// Like [`Self::provider_api_key`], but with a hint when it is missing.
    pub fn require_api_key(&self, provider_id: ProviderId) -> Result<Option<String>> {
        if !provider_id.requires_api_key() {
            return Ok(None);
        }
        let key = self.provider_api_key(provider_id).ok_or_else(|| {
            anyhow!(
                "No API key configured for provider '{provider_id}'.\n\
                 Hint: run `weather-refresh configure {provider_id}` and enter your API key."
            )
        })?;
        Ok(Some(key.to_string()))
    }

    pub fn refresh_interval_secs(&self, provider_id: ProviderId) -> u64 {
        self.provider_config(provider_id)
            .and_then(|cfg| cfg.refresh_interval_secs)
            .unwrap_or_else(|| provider_id.default_interval_secs())
    }
}
