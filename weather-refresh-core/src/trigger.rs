//! Periodic invocation of pipelines.
//!
//! [`PeriodicTrigger`] is the seam to whatever fires scheduled runs. The
//! controller only registers and cancels; it never knows which backend is
//! active. [`TokioTrigger`] is the in-process backend used by the daemon.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::model::Outcome;
use crate::pipeline::{JobTag, RefreshPipeline, Trigger};
use crate::provider::ProviderId;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

pub trait PeriodicTrigger: Send + Sync + Debug {
    /// Fire every `interval`, replacing any registration for the same job.
    fn register(&self, provider: ProviderId, tag: JobTag, interval: Duration, flex: Duration);

    fn cancel(&self, provider: ProviderId, tag: JobTag);
}

/// Exponential backoff used after a `Reschedule` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// `initial * 2^attempt`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
pub struct TokioTrigger {
    pipelines: Mutex<HashMap<ProviderId, Arc<RefreshPipeline>>>,
    loops: Mutex<HashMap<(ProviderId, JobTag), JoinHandle<()>>>,
    initial_backoff: Duration,
}

impl Default for TokioTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioTrigger {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Make `pipeline` the target for its provider's registrations.
    pub fn attach(&self, pipeline: Arc<RefreshPipeline>) {
        self.pipelines.lock().insert(pipeline.provider(), pipeline);
    }

    pub fn is_registered(&self, provider: ProviderId, tag: JobTag) -> bool {
        self.loops
            .lock()
            .get(&(provider, tag))
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.loops.lock().drain() {
            handle.abort();
        }
    }
}

impl PeriodicTrigger for TokioTrigger {
    fn register(&self, provider: ProviderId, tag: JobTag, interval: Duration, flex: Duration) {
        let Some(pipeline) = self.pipelines.lock().get(&provider).cloned() else {
            tracing::warn!(%provider, %tag, "no pipeline attached, not registering");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%provider, %tag, "no tokio runtime, not registering");
            return;
        };

        let backoff = Backoff {
            initial: self.initial_backoff,
            max: flex,
        };
        let handle = runtime.spawn(run_periodically(pipeline, tag, interval, backoff));
        if let Some(previous) = self.loops.lock().insert((provider, tag), handle) {
            previous.abort();
        }
        tracing::info!(%provider, %tag, ?interval, ?flex, "periodic trigger registered");
    }

    fn cancel(&self, provider: ProviderId, tag: JobTag) {
        if let Some(handle) = self.loops.lock().remove(&(provider, tag)) {
            handle.abort();
            tracing::info!(%provider, %tag, "periodic trigger cancelled");
        }
    }
}

impl Drop for TokioTrigger {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_periodically(
    pipeline: Arc<RefreshPipeline>,
    tag: JobTag,
    interval: Duration,
    backoff: Backoff,
) {
    // tokio intervals panic on zero.
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let mut attempt = 0;
        loop {
            match pipeline.execute(Trigger::Scheduled(tag)).await {
                Outcome::Success => break,
                Outcome::Failure => {
                    tracing::warn!(provider = %pipeline.provider(), %tag, "run failed, stopping trigger");
                    return;
                }
                Outcome::Reschedule => {
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::debug!(?delay, attempt, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
