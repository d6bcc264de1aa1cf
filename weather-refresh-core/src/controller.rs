use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, TimeDelta};

use crate::{
    clock::{seconds, Clock},
    error::StoreError,
    model::{DayPhase, Outcome, TimeOfDay, WeatherOverrides, WeatherRecord},
    notify::{Notifier, Subscription},
    pipeline::{JobTag, RefreshPipeline, Trigger},
    provider::ProviderId,
    store::{ScheduleMetadata, Store},
    trigger::PeriodicTrigger,
};

pub const DEFAULT_LAPSE_MULTIPLIER: u32 = 2;

/// Parameters a scheduler passes back when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerParams {
    pub tag: JobTag,
}

/// Sun events reported by a geofence or sensor, independent of any fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

/// Public face of one provider: scheduling, manual runs and reads.
#[derive(Debug)]
pub struct ScheduleController {
    pipeline: Arc<RefreshPipeline>,
    trigger: Arc<dyn PeriodicTrigger>,
    store: Arc<dyn Store>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    lapse_multiplier: u32,
    overrides: WeatherOverrides,
    offset: FixedOffset,
}

impl ScheduleController {
    pub fn new(
        pipeline: Arc<RefreshPipeline>,
        trigger: Arc<dyn PeriodicTrigger>,
        store: Arc<dyn Store>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            trigger,
            store,
            notifier,
            clock,
            lapse_multiplier: DEFAULT_LAPSE_MULTIPLIER,
            overrides: WeatherOverrides::default(),
            offset: crate::provider::local_offset(),
        }
    }

    pub fn with_lapse_multiplier(mut self, multiplier: u32) -> Self {
        self.lapse_multiplier = multiplier.max(1);
        self
    }

    pub fn with_overrides(mut self, overrides: WeatherOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Offset used to turn the clock's instant into a wall-clock time.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn provider(&self) -> ProviderId {
        self.pipeline.provider()
    }

    fn namespace(&self) -> &'static str {
        self.provider().as_str()
    }

    /// Store the interval and credentials, mark scheduled, and register the
    /// periodic trigger.
    pub fn schedule(
        &self,
        interval_secs: u64,
        api_key: Option<String>,
    ) -> Result<ScheduleMetadata, StoreError> {
        let provider = self.provider();
        let now = self.clock.now();
        let mut api_key = api_key;
        let metadata = self.store.update_metadata(self.namespace(), &mut |m| {
            if let Some(key) = api_key.take() {
                m.api_key = Some(key);
            }
            m.refresh_interval_seconds = Some(interval_secs);
            m.scheduled = true;
            m.schedule_timestamp = now;
        })?;

        self.trigger.register(
            provider,
            JobTag::Weather,
            Duration::from_secs(interval_secs),
            Duration::from_secs(provider.flex_secs()),
        );
        tracing::info!(%provider, interval_secs, "refresh scheduled");
        Ok(metadata)
    }

    /// Stop future runs. An in-flight run is not interrupted.
    pub fn cancel(&self) -> Result<(), StoreError> {
        let provider = self.provider();
        self.trigger.cancel(provider, JobTag::Weather);
        self.store
            .update_metadata(self.namespace(), &mut |m| m.scheduled = false)?;
        tracing::info!(%provider, "refresh cancelled");
        Ok(())
    }

    /// Refresh now, bypassing staleness and the schedule. Runs on a separate
    /// task; the caller awaits the outcome.
    pub async fn run_now(&self) -> Outcome {
        let pipeline = self.pipeline.clone();
        match tokio::spawn(async move { pipeline.execute(Trigger::Manual).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(provider = %self.provider(), error = %e, "manual refresh task died");
                Outcome::Failure
            }
        }
    }

    /// Entry point for the scheduler. No params means a manual run.
    pub async fn on_trigger(&self, params: Option<TriggerParams>) -> Outcome {
        let trigger = match params {
            Some(params) => Trigger::Scheduled(params.tag),
            None => Trigger::Manual,
        };
        self.pipeline.execute(trigger).await
    }

    /// The stored flag, unless the schedule looks lapsed.
    ///
    /// Lapsed means neither a refresh nor a `schedule` call happened within
    /// `lapse_multiplier` intervals, which is what a silently dropped OS job
    /// looks like.
    pub fn is_scheduled(&self) -> Result<bool, StoreError> {
        let metadata = self.store.load_metadata(self.namespace())?;
        if !metadata.scheduled {
            return Ok(false);
        }
        Ok(!self.is_lapsed(&metadata)?)
    }

    fn is_lapsed(&self, metadata: &ScheduleMetadata) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let window = seconds(self.interval_secs(metadata))
            .checked_mul(i32::try_from(self.lapse_multiplier).unwrap_or(i32::MAX))
            .unwrap_or(TimeDelta::MAX);

        let last_update = self.store.load_record(self.namespace())?.last_update();
        let ran_recently = now - last_update <= window;
        let scheduled_recently = now - metadata.schedule_timestamp <= window;
        Ok(!ran_recently && !scheduled_recently)
    }

    /// Persist a new interval. Takes effect at the next `schedule` or
    /// `reinitialize`.
    pub fn set_refresh_interval(&self, interval_secs: u64) -> Result<(), StoreError> {
        self.store.update_metadata(self.namespace(), &mut |m| {
            m.refresh_interval_seconds = Some(interval_secs);
            m.scheduled = true;
        })?;
        Ok(())
    }

    /// Re-register after a restart if the stored schedule is still live.
    /// Returns whether anything was registered.
    pub fn reinitialize(&self) -> Result<bool, StoreError> {
        if !self.is_scheduled()? {
            return Ok(false);
        }
        let metadata = self.store.load_metadata(self.namespace())?;
        self.schedule(self.interval_secs(&metadata), metadata.api_key)?;
        Ok(true)
    }

    /// Record that the sun is about to rise or set `lead` from now. No
    /// network; persists and notifies.
    pub async fn on_sun_event(
        &self,
        event: SunEvent,
        lead: TimeDelta,
    ) -> Result<WeatherRecord, StoreError> {
        let at = TimeOfDay::at(self.clock.now() + lead, self.offset);
        tracing::info!(provider = %self.provider(), ?event, %at, "sun event");
        self.pipeline
            .update_record(move |record| match event {
                SunEvent::Sunrise => record.set_sunrise(at),
                SunEvent::Sunset => record.set_sunset(at),
            })
            .await
    }

    /// Latest stored record with read-time overrides applied.
    pub fn weather(&self) -> Result<WeatherRecord, StoreError> {
        let record = self.store.load_record(self.namespace())?;
        Ok(self.overrides.apply(&record))
    }

    pub fn day_phase(&self) -> Result<DayPhase, StoreError> {
        let now = TimeOfDay::at(self.clock.now(), self.offset);
        Ok(self.weather()?.day_phase(now))
    }

    pub fn metadata(&self) -> Result<ScheduleMetadata, StoreError> {
        self.store.load_metadata(self.namespace())
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe_to(self.provider())
    }

    fn interval_secs(&self, metadata: &ScheduleMetadata) -> u64 {
        metadata.interval_secs(self.provider().default_interval_secs())
    }
}
