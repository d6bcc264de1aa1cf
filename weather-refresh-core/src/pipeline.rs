use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::{
    clock::Clock,
    error::{RefreshError, StoreError},
    fetch::{Fetcher, DEFAULT_READ_TIMEOUT},
    location::{LocationResolver, DEFAULT_LOCATION_TIMEOUT},
    model::{Outcome, WeatherRecord},
    notify::{ChangeEvent, Notifier},
    provider::{ProviderAdapter, ProviderId},
    staleness::StalenessPolicy,
    store::Store,
};

/// Which sub-job a scheduled trigger belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobTag {
    #[default]
    Weather,
    Astronomy,
}

impl JobTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTag::Weather => "weather",
            JobTag::Astronomy => "astronomy",
        }
    }
}

impl fmt::Display for JobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// User-initiated; never skipped as fresh.
    Manual,
    Scheduled(JobTag),
}

impl Trigger {
    /// Only scheduled weather runs may be skipped when the record is fresh.
    pub fn applies_staleness(&self) -> bool {
        matches!(self, Trigger::Scheduled(JobTag::Weather))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => f.write_str("manual"),
            Trigger::Scheduled(tag) => write!(f, "scheduled:{tag}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    CheckStaleness,
    ResolveLocation,
    Fetching,
    Parsing,
    Persisting,
    Done,
}

/// Per-stage budgets. They are independent, not slices of one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimeouts {
    pub location: Duration,
    pub network: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            location: DEFAULT_LOCATION_TIMEOUT,
            network: DEFAULT_READ_TIMEOUT,
        }
    }
}

enum Refresh {
    Skipped,
    Updated(WeatherRecord),
}

/// One provider's refresh: staleness check, location, fetch, parse, persist,
/// notify. Runs for the same pipeline never overlap.
pub struct RefreshPipeline {
    adapter: Arc<dyn ProviderAdapter>,
    fetcher: Arc<dyn Fetcher>,
    resolver: LocationResolver,
    store: Arc<dyn Store>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    staleness: StalenessPolicy,
    timeouts: PipelineTimeouts,
    run_lock: tokio::sync::Mutex<()>,
    stage: parking_lot::Mutex<Stage>,
}

impl fmt::Debug for RefreshPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshPipeline")
            .field("provider", &self.adapter.id())
            .field("stage", &self.stage())
            .field("staleness", &self.staleness)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl RefreshPipeline {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        fetcher: Arc<dyn Fetcher>,
        resolver: LocationResolver,
        store: Arc<dyn Store>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let staleness = StalenessPolicy::with_flex_secs(adapter.id().flex_secs());
        Self {
            adapter,
            fetcher,
            resolver,
            store,
            notifier,
            clock,
            staleness,
            timeouts: PipelineTimeouts::default(),
            run_lock: tokio::sync::Mutex::new(()),
            stage: parking_lot::Mutex::new(Stage::Idle),
        }
    }

    pub fn with_staleness(mut self, staleness: StalenessPolicy) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_timeouts(mut self, timeouts: PipelineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn provider(&self) -> ProviderId {
        self.adapter.id()
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Run once and report how the scheduler should proceed.
    ///
    /// A second call while one is in flight waits for the first to finish.
    /// No error escapes; every failure becomes an [`Outcome`].
    #[instrument(skip(self), fields(provider = %self.adapter.id()))]
    pub async fn execute(&self, trigger: Trigger) -> Outcome {
        let _running = self.run_lock.lock().await;

        let outcome = match self.run(trigger).await {
            Ok(Refresh::Skipped) => {
                tracing::info!("record still fresh, skipping fetch");
                Outcome::Success
            }
            Ok(Refresh::Updated(record)) => {
                tracing::info!(
                    condition = %record.condition(),
                    celsius = record.celsius(),
                    last_update = %record.last_update(),
                    "record refreshed"
                );
                Outcome::Success
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "refresh failed, rescheduling");
                Outcome::Reschedule
            }
            Err(e) => {
                tracing::error!(error = %e, "refresh failed permanently");
                Outcome::Failure
            }
        };

        self.enter(Stage::Done);
        self.enter(Stage::Idle);
        outcome
    }

    async fn run(&self, trigger: Trigger) -> Result<Refresh, RefreshError> {
        let provider = self.adapter.id();
        let namespace = provider.as_str();

        self.enter(Stage::CheckStaleness);
        let metadata = self.store.load_metadata(namespace)?;
        let current = self.store.load_record(namespace)?;
        let interval = metadata.interval_secs(provider.default_interval_secs());
        if self.staleness.should_skip(
            current.last_update(),
            self.clock.now(),
            interval,
            !trigger.applies_staleness(),
        ) {
            return Ok(Refresh::Skipped);
        }

        self.enter(Stage::ResolveLocation);
        let position = self.resolver.try_resolve(self.timeouts.location).await?;

        self.enter(Stage::Fetching);
        let url = self.adapter.build_request(&position, &metadata)?;
        tracing::debug!(scheme = url.scheme(), host = url.host_str(), "fetching");
        let body = self.fetcher.fetch(&url, self.timeouts.network).await?;

        self.enter(Stage::Parsing);
        // Seed from what is stored so fields this provider does not supply survive.
        let mut record = self.store.load_record(namespace)?;
        self.adapter.parse(&body, &mut record)?;

        self.enter(Stage::Persisting);
        let record = self
            .store
            .persist_record(namespace, record, self.clock.now())?;
        self.notifier.publish(ChangeEvent { provider });

        Ok(Refresh::Updated(record))
    }

    /// Apply a local edit to the stored record without touching the network,
    /// then persist and notify. Serialized with [`Self::execute`].
    pub async fn update_record<F>(&self, edit: F) -> Result<WeatherRecord, StoreError>
    where
        F: FnOnce(&mut WeatherRecord) + Send,
    {
        let _running = self.run_lock.lock().await;
        let provider = self.adapter.id();

        let mut record = self.store.load_record(provider.as_str())?;
        edit(&mut record);
        let record = self
            .store
            .persist_record(provider.as_str(), record, self.clock.now())?;
        self.notifier.publish(ChangeEvent { provider });
        Ok(record)
    }

    fn enter(&self, stage: Stage) {
        tracing::debug!(?stage, "stage");
        *self.stage.lock() = stage;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FetchError;
    use crate::location::tests::ScriptedSource;
    use crate::model::{Condition, MoonPhase, Position, TimeOfDay};
    use crate::provider::pirateweather::PirateWeatherAdapter;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
    use reqwest::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const OTTAWA: &str = include_str!("../fixtures/pirateweather_ottawa.json");

    /// Serves a canned body and records how it was called.
    #[derive(Debug, Default)]
    pub(crate) struct CountingFetcher {
        pub body: String,
        pub status: Option<u16>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl CountingFetcher {
        pub fn ok(body: &str) -> Self {
            Self {
                body: body.to_string(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _url: &Url, _timeout: Duration) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.status {
                Some(status) => Err(FetchError::Status {
                    status,
                    body: String::new(),
                }),
                None => Ok(self.body.clone()),
            }
        }
    }

    pub(crate) fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_674_318_840, 0).unwrap()
    }

    pub(crate) struct Harness {
        pub pipeline: Arc<RefreshPipeline>,
        pub fetcher: Arc<CountingFetcher>,
        pub store: Arc<MemoryStore>,
        pub notifier: Notifier,
        pub clock: ManualClock,
    }

    pub(crate) fn harness(fetcher: CountingFetcher, source: ScriptedSource) -> Harness {
        let clock = ManualClock::new(now());
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new();
        store
            .update_metadata("pirateweather", &mut |m| m.api_key = Some("PIRATE".into()))
            .unwrap();

        let adapter = PirateWeatherAdapter::new().with_offset(FixedOffset::west_opt(5 * 3600).unwrap());
        let resolver = LocationResolver::new(Arc::new(source), Arc::new(clock.clone()));
        let pipeline = RefreshPipeline::new(
            Arc::new(adapter),
            fetcher.clone(),
            resolver,
            store.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
        );

        Harness {
            pipeline: Arc::new(pipeline),
            fetcher,
            store,
            notifier,
            clock,
        }
    }

    pub(crate) fn ottawa() -> ScriptedSource {
        ScriptedSource::cached(Position::new(45.42, -75.69, now() - TimeDelta::minutes(5)))
    }

    #[tokio::test]
    async fn fresh_record_short_circuits_scheduled_run() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        let fresh = h
            .store
            .persist_record("pirateweather", WeatherRecord::default(), now() - TimeDelta::minutes(1))
            .unwrap();

        let outcome = h.pipeline.execute(Trigger::Scheduled(JobTag::Weather)).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.store.load_record("pirateweather").unwrap(), fresh);
    }

    #[tokio::test]
    async fn manual_run_always_fetches() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        h.store
            .persist_record("pirateweather", WeatherRecord::default(), now())
            .unwrap();
        h.clock.advance(TimeDelta::seconds(1));

        assert_eq!(h.pipeline.execute(Trigger::Manual).await, Outcome::Success);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(
            h.store.load_record("pirateweather").unwrap().last_update(),
            now() + TimeDelta::seconds(1)
        );
    }

    #[tokio::test]
    async fn astronomy_runs_ignore_staleness() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        h.store
            .persist_record("pirateweather", WeatherRecord::default(), now())
            .unwrap();

        let outcome = h.pipeline.execute(Trigger::Scheduled(JobTag::Astronomy)).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn end_to_end_refresh_persists_and_notifies() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        let mut changes = h.notifier.subscribe();

        let outcome = h.pipeline.execute(Trigger::Scheduled(JobTag::Weather)).await;
        assert_eq!(outcome, Outcome::Success);

        let stored = h.store.load_record("pirateweather").unwrap();
        assert_eq!(stored.condition(), Condition::Sunny);
        assert!((stored.celsius() - (-4.59)).abs() < 1e-4);
        assert_eq!(stored.last_update(), now());

        let mut expected = WeatherRecord::default();
        expected.set_condition(Condition::Sunny);
        expected.set_celsius(-4.59_f64 as f32);
        expected.set_moon_phase(MoonPhase::NewMoon);
        expected.set_sunrise(TimeOfDay::new(7, 35).unwrap());
        expected.set_sunset(TimeOfDay::new(16, 53).unwrap());
        assert_eq!(stored, expected.stamped(now()));

        assert_eq!(
            changes.try_recv(),
            Some(ChangeEvent {
                provider: ProviderId::PirateWeather
            })
        );
        assert_eq!(h.pipeline.stage(), Stage::Idle);
    }

    #[tokio::test]
    async fn no_location_reschedules_without_fetching() {
        let source = ScriptedSource {
            permission: false,
            ..Default::default()
        };
        let h = harness(CountingFetcher::ok(OTTAWA), source);
        let mut changes = h.notifier.subscribe();

        assert_eq!(h.pipeline.execute(Trigger::Manual).await, Outcome::Reschedule);
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(
            h.store.load_record("pirateweather").unwrap(),
            WeatherRecord::default()
        );
        assert_eq!(changes.try_recv(), None);
    }

    #[tokio::test]
    async fn fetch_and_parse_errors_reschedule_and_leave_record_alone() {
        let failing = CountingFetcher {
            status: Some(503),
            ..Default::default()
        };
        let h = harness(failing, ottawa());
        assert_eq!(h.pipeline.execute(Trigger::Manual).await, Outcome::Reschedule);
        assert_eq!(h.fetcher.calls(), 1);

        for body in ["{\"currently\": 7}", "{}"] {
            let h = harness(CountingFetcher::ok(body), ottawa());
            let mut changes = h.notifier.subscribe();
            assert_eq!(h.pipeline.execute(Trigger::Manual).await, Outcome::Reschedule, "{body}");
            assert_eq!(
                h.store.load_record("pirateweather").unwrap().last_update(),
                DateTime::<Utc>::default()
            );
            assert!(changes.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn missing_api_key_reschedules_before_fetch() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        h.store
            .update_metadata("pirateweather", &mut |m| m.api_key = None)
            .unwrap();

        assert_eq!(h.pipeline.execute(Trigger::Manual).await, Outcome::Reschedule);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_scheduled_triggers_do_not_interleave() {
        let slow = CountingFetcher {
            body: OTTAWA.to_string(),
            delay: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let h = harness(slow, ottawa());

        let (a, b) = tokio::join!(
            h.pipeline.execute(Trigger::Scheduled(JobTag::Weather)),
            h.pipeline.execute(Trigger::Scheduled(JobTag::Weather)),
        );

        assert_eq!((a, b), (Outcome::Success, Outcome::Success));
        // The second run saw the first one's lastUpdate and skipped.
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_manual_runs_are_serialized() {
        let slow = CountingFetcher {
            body: OTTAWA.to_string(),
            delay: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let h = harness(slow, ottawa());
        let (p1, p2) = (h.pipeline.clone(), h.pipeline.clone());

        let first = tokio::spawn(async move { p1.execute(Trigger::Manual).await });
        let second = tokio::spawn(async move { p2.execute(Trigger::Manual).await });

        assert_eq!(first.await.unwrap(), Outcome::Success);
        assert_eq!(second.await.unwrap(), Outcome::Success);
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(h.fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_update_persists_and_notifies_without_network() {
        let h = harness(CountingFetcher::ok(OTTAWA), ottawa());
        let mut changes = h.notifier.subscribe_to(ProviderId::PirateWeather);
        let sunrise = TimeOfDay::new(5, 55).unwrap();

        let record = h
            .pipeline
            .update_record(|r| r.set_sunrise(sunrise))
            .await
            .unwrap();

        assert_eq!(record.sunrise(), sunrise);
        assert_eq!(record.last_update(), now());
        assert_eq!(h.fetcher.calls(), 0);
        assert!(changes.try_recv().is_some());
    }
}
