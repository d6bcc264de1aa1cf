//! Core library for the `weather-refresh` CLI.
//!
//! This crate defines:
//! - The refresh pipeline (staleness check, location, fetch, parse, persist, notify)
//! - Provider adapters for the supported weather backends
//! - Scheduling: the controller, the periodic trigger seam and a tokio backend
//! - Configuration & credentials handling
//!
//! It is used by `weather-refresh-cli`, but can also be embedded in other
//! binaries or services.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod location;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod provider;
pub mod staleness;
pub mod store;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ProviderConfig};
pub use controller::{ScheduleController, SunEvent, TriggerParams};
pub use error::{FetchError, LocationError, ParseError, RefreshError, StoreError};
pub use fetch::{Fetcher, HttpFetcher};
pub use location::{LocationResolver, LocationSource, StaticLocationSource};
pub use model::{
    Condition, DayPhase, MoonPhase, Outcome, Position, TimeOfDay, WeatherOverrides, WeatherRecord,
};
pub use notify::{ChangeEvent, Notifier, Subscription};
pub use pipeline::{JobTag, PipelineTimeouts, RefreshPipeline, Trigger};
pub use provider::{ProviderAdapter, ProviderId};
pub use staleness::StalenessPolicy;
pub use store::{FileStore, MemoryStore, ScheduleMetadata, Store};
pub use trigger::{PeriodicTrigger, TokioTrigger};
