//! Persistence for the latest record and per-provider schedule metadata.
//!
//! One namespace per provider. [`FileStore`] keeps each namespace in its own
//! JSON file and replaces it atomically (write temp file, then rename).

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::WeatherRecord;

/// Persisted scheduling state for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleMetadata {
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub schedule_timestamp: DateTime<Utc>,
    /// Override of the provider's default refresh interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ScheduleMetadata {
    pub fn interval_secs(&self, provider_default: u64) -> u64 {
        self.refresh_interval_seconds.unwrap_or(provider_default)
    }
}

pub trait Store: Send + Sync + Debug {
    /// The stored record, or a default one if nothing was persisted yet.
    fn load_record(&self, namespace: &str) -> Result<WeatherRecord, StoreError>;

    /// Stamp `record` with `now`, write it, and return what was written.
    fn persist_record(
        &self,
        namespace: &str,
        record: WeatherRecord,
        now: DateTime<Utc>,
    ) -> Result<WeatherRecord, StoreError>;

    fn load_metadata(&self, namespace: &str) -> Result<ScheduleMetadata, StoreError>;

    /// Read-modify-write of the metadata; returns the updated value.
    fn update_metadata(
        &self,
        namespace: &str,
        update: &mut dyn FnMut(&mut ScheduleMetadata),
    ) -> Result<ScheduleMetadata, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Namespace {
    #[serde(flatten)]
    metadata: ScheduleMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record: Option<WeatherRecord>,
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn read(&self, namespace: &str) -> Result<Namespace, StoreError> {
        let path = self.path_for(namespace);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Namespace::default()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn write(&self, namespace: &str, ns: &Namespace) -> Result<(), StoreError> {
        let path = self.path_for(namespace);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(ns)?;
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        Ok(())
    }
}

impl Store for FileStore {
    fn load_record(&self, namespace: &str) -> Result<WeatherRecord, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read(namespace)?.record.unwrap_or_default())
    }

    fn persist_record(
        &self,
        namespace: &str,
        record: WeatherRecord,
        now: DateTime<Utc>,
    ) -> Result<WeatherRecord, StoreError> {
        let _guard = self.lock.lock();
        let mut ns = self.read(namespace)?;
        let record = record.stamped(now);
        ns.record = Some(record.clone());
        self.write(namespace, &ns)?;
        Ok(record)
    }

    fn load_metadata(&self, namespace: &str) -> Result<ScheduleMetadata, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read(namespace)?.metadata)
    }

    fn update_metadata(
        &self,
        namespace: &str,
        update: &mut dyn FnMut(&mut ScheduleMetadata),
    ) -> Result<ScheduleMetadata, StoreError> {
        let _guard = self.lock.lock();
        let mut ns = self.read(namespace)?;
        update(&mut ns.metadata);
        self.write(namespace, &ns)?;
        Ok(ns.metadata)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: Mutex<HashMap<String, Namespace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_record(&self, namespace: &str) -> Result<WeatherRecord, StoreError> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace)
            .and_then(|ns| ns.record.clone())
            .unwrap_or_default())
    }

    fn persist_record(
        &self,
        namespace: &str,
        record: WeatherRecord,
        now: DateTime<Utc>,
    ) -> Result<WeatherRecord, StoreError> {
        let record = record.stamped(now);
        self.namespaces
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .record = Some(record.clone());
        Ok(record)
    }

    fn load_metadata(&self, namespace: &str) -> Result<ScheduleMetadata, StoreError> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace)
            .map(|ns| ns.metadata.clone())
            .unwrap_or_default())
    }

    fn update_metadata(
        &self,
        namespace: &str,
        update: &mut dyn FnMut(&mut ScheduleMetadata),
    ) -> Result<ScheduleMetadata, StoreError> {
        let mut namespaces = self.namespaces.lock();
        let ns = namespaces.entry(namespace.to_string()).or_default();
        update(&mut ns.metadata);
        Ok(ns.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, MoonPhase, TimeOfDay};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn sample() -> WeatherRecord {
        let mut record = WeatherRecord::default();
        record.set_celsius(-4.59);
        record.set_condition(Condition::Cloudy);
        record.set_moon_phase(MoonPhase::WaningCrescent);
        record.set_sunrise(TimeOfDay::new(7, 35).unwrap());
        record.set_sunset(TimeOfDay::new(16, 53).unwrap());
        record.set_wind_kph(7);
        record
    }

    #[test]
    fn file_store_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let written = store
            .persist_record("pirateweather", sample(), at(1_674_318_840))
            .unwrap();
        let reopened = FileStore::open(dir.path()).unwrap();
        let loaded = reopened.load_record("pirateweather").unwrap();

        assert_eq!(loaded, written);
        assert_eq!(loaded.last_update(), at(1_674_318_840));
        assert_eq!(loaded, sample().stamped(at(1_674_318_840)));
    }

    #[test]
    fn missing_namespace_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_record("openweather").unwrap(), WeatherRecord::default());
        assert_eq!(
            store.load_metadata("openweather").unwrap(),
            ScheduleMetadata::default()
        );
    }

    #[test]
    fn metadata_and_record_share_a_namespace_without_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store
            .update_metadata("openweather", &mut |m| {
                m.scheduled = true;
                m.schedule_timestamp = at(1_000);
                m.api_key = Some("KEY".into());
            })
            .unwrap();
        store
            .persist_record("openweather", sample(), at(2_000))
            .unwrap();

        let meta = store.load_metadata("openweather").unwrap();
        assert!(meta.scheduled);
        assert_eq!(meta.schedule_timestamp, at(1_000));
        assert_eq!(meta.api_key.as_deref(), Some("KEY"));
        assert_eq!(store.load_record("openweather").unwrap().last_update(), at(2_000));

        // Namespaces are independent.
        assert!(!store.load_metadata("wunderground").unwrap().scheduled);
    }

    #[test]
    fn metadata_file_uses_documented_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .update_metadata("ambient", &mut |m| {
                m.scheduled = true;
                m.schedule_timestamp = at(1_674_318_840);
                m.refresh_interval_seconds = Some(900);
            })
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("ambient.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["scheduled"], true);
        assert_eq!(value["scheduleTimestamp"], 1_674_318_840_000_i64);
        assert_eq!(value["refreshIntervalSeconds"], 900);
        assert!(value.get("apiKey").is_none());
        assert!(!dir.path().join("ambient.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("openweather.json"), "{not json").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load_record("openweather"),
            Err(StoreError::Serde(_))
        ));
    }

    #[test]
    fn memory_store_stamps_on_persist() {
        let store = MemoryStore::new();
        let written = store.persist_record("x", sample(), at(42)).unwrap();
        assert_eq!(written.last_update(), at(42));
        assert_eq!(store.load_record("x").unwrap(), written);
        assert_eq!(ScheduleMetadata::default().interval_secs(7200), 7200);
    }
}
