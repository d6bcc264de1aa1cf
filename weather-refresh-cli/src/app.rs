//! Wires concrete collaborators into per-provider controllers.

use std::sync::Arc;

use anyhow::{Context, Result};
use weather_refresh_core::{
    Clock, Config, FileStore, Fetcher, HttpFetcher, LocationResolver, Notifier, PipelineTimeouts,
    ProviderId, RefreshPipeline, ScheduleController, StaticLocationSource, Store, SystemClock,
    TokioTrigger,
    provider::{
        adapter_for,
        ambient::{FileSnapshotSource, SnapshotFetcher},
        local_offset,
    },
};

const DEFAULT_SNAPSHOT_FILE: &str = "ambient-snapshot.json";

pub struct App {
    config: Config,
    store: Arc<FileStore>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    trigger: Arc<TokioTrigger>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let state_dir = config.state_dir()?;
        let store = FileStore::open(&state_dir)
            .with_context(|| format!("Failed to open state directory: {}", state_dir.display()))?;

        Ok(Self {
            config,
            store: Arc::new(store),
            notifier: Notifier::new(),
            clock: Arc::new(SystemClock),
            trigger: Arc::new(TokioTrigger::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Build the controller for `id`. A key from the config file is mirrored
    /// into the provider's stored credentials.
    pub fn controller(&self, id: ProviderId) -> Result<ScheduleController> {
        let pipeline = Arc::new(self.pipeline(id)?);
        self.trigger.attach(pipeline.clone());

        if let Some(key) = self.config.provider_api_key(id) {
            let key = key.to_string();
            self.store
                .update_metadata(id.as_str(), &mut |m| m.api_key = Some(key.clone()))
                .with_context(|| format!("Failed to store credentials for provider '{id}'"))?;
        }

        Ok(ScheduleController::new(
            pipeline,
            self.trigger.clone(),
            self.store.clone(),
            self.notifier.clone(),
            self.clock.clone(),
        )
        .with_lapse_multiplier(self.config.schedule.lapse_multiplier))
    }

    fn pipeline(&self, id: ProviderId) -> Result<RefreshPipeline> {
        let source = StaticLocationSource::new(self.config.location.coordinates(), self.clock.clone());
        let resolver = LocationResolver::new(Arc::new(source), self.clock.clone())
            .with_max_staleness_secs(self.config.location.max_staleness_secs)
            .with_priority(self.config.location.priority);

        Ok(RefreshPipeline::new(
            adapter_for(id, local_offset()),
            self.fetcher(id)?,
            resolver,
            self.store.clone(),
            self.notifier.clone(),
            self.clock.clone(),
        )
        .with_timeouts(PipelineTimeouts {
            location: self.config.location.timeout(),
            network: self.config.network.read_timeout(),
        }))
    }

    fn fetcher(&self, id: ProviderId) -> Result<Arc<dyn Fetcher>> {
        if id == ProviderId::Ambient {
            let path = match &self.config.ambient.snapshot_path {
                Some(path) => path.clone(),
                None => self.config.state_dir()?.join(DEFAULT_SNAPSHOT_FILE),
            };
            return Ok(Arc::new(SnapshotFetcher::new(Arc::new(FileSnapshotSource::new(path)))));
        }

        let http = HttpFetcher::with_connect_timeout(self.config.network.connect_timeout())
            .context("Failed to build HTTP client")?;
        Ok(Arc::new(http))
    }
}
