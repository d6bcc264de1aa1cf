//! Position acquisition with a freshness cutoff and a bounded wait.
//!
//! The cached last-known position is preferred. Only when it is missing or
//! too old do we ask the source for live updates, and then we wait at most
//! `timeout` for the first acceptable fix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::clock::{seconds, Clock};
use crate::error::LocationError;
use crate::model::Position;

pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_STALENESS_SECS: u64 = 30 * 60;

/// Power/accuracy trade-off requested from the location source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    LowPower,
    Balanced,
    HighAccuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The platform's location subsystem.
#[async_trait]
pub trait LocationSource: Send + Sync {
    fn has_permission(&self) -> bool;

    /// Most recent cached fix, if the platform has one.
    async fn last_known(&self) -> Option<Position>;

    /// Start streaming fixes into `listener` until [`Self::remove_updates`].
    fn request_updates(&self, priority: Priority, listener: LocationListener) -> SubscriptionId;

    fn remove_updates(&self, id: SubscriptionId);
}

/// One-shot sink handed to a [`LocationSource`] for live updates.
///
/// The first fresh position completes the waiting resolver; anything after
/// that, or after the resolver gave up, is dropped.
#[derive(Clone)]
pub struct LocationListener {
    slot: Arc<Mutex<Option<oneshot::Sender<Position>>>>,
    clock: Arc<dyn Clock>,
    max_staleness: TimeDelta,
}

impl std::fmt::Debug for LocationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationListener")
            .field("open", &self.is_open())
            .field("max_staleness", &self.max_staleness)
            .finish()
    }
}

impl LocationListener {
    fn new(
        tx: oneshot::Sender<Position>,
        clock: Arc<dyn Clock>,
        max_staleness: TimeDelta,
    ) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
            clock,
            max_staleness,
        }
    }

    /// Deliver a fix. Returns `true` if it completed the pending request.
    pub fn on_location(&self, position: Position) -> bool {
        if position.age(self.clock.now()) > self.max_staleness {
            tracing::debug!(age = ?position.age(self.clock.now()), "ignoring stale live fix");
            return false;
        }
        match self.slot.lock().take() {
            Some(tx) => tx.send(position).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn close(&self) {
        self.slot.lock().take();
    }
}

/// Deregisters the live subscription when dropped, whichever way the wait ends.
struct Subscription<'a> {
    source: &'a dyn LocationSource,
    id: SubscriptionId,
    listener: LocationListener,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.listener.close();
        self.source.remove_updates(self.id);
        tracing::debug!(id = self.id.0, "location updates removed");
    }
}

#[derive(Clone)]
pub struct LocationResolver {
    source: Arc<dyn LocationSource>,
    clock: Arc<dyn Clock>,
    max_staleness: TimeDelta,
    priority: Priority,
}

impl std::fmt::Debug for LocationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationResolver")
            .field("max_staleness", &self.max_staleness)
            .field("priority", &self.priority)
            .finish()
    }
}

impl LocationResolver {
    pub fn new(source: Arc<dyn LocationSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            max_staleness: seconds(DEFAULT_MAX_STALENESS_SECS),
            priority: Priority::default(),
        }
    }

    pub fn with_max_staleness(mut self, max_staleness: TimeDelta) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    pub fn with_max_staleness_secs(self, secs: u64) -> Self {
        self.with_max_staleness(seconds(secs))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// A position, or `None` when no acceptable fix is available in time.
    pub async fn resolve(&self, timeout: Duration) -> Option<Position> {
        match self.try_resolve(timeout).await {
            Ok(position) => Some(position),
            Err(e) => {
                tracing::debug!(error = %e, "no location");
                None
            }
        }
    }

    pub async fn try_resolve(&self, timeout: Duration) -> Result<Position, LocationError> {
        if !self.source.has_permission() {
            return Err(LocationError::PermissionDenied);
        }

        match tokio::time::timeout(timeout, self.source.last_known()).await {
            Ok(Some(position)) if self.is_fresh(&position) => {
                tracing::debug!("using cached location");
                return Ok(position);
            }
            Ok(Some(position)) => {
                tracing::debug!(age = ?position.age(self.clock.now()), "cached location too old");
            }
            Ok(None) => tracing::debug!("no cached location"),
            Err(_) => tracing::warn!(?timeout, "timed out waiting for a cached location"),
        }

        tracing::debug!(priority = ?self.priority, "requesting a live location");
        let (tx, rx) = oneshot::channel();
        let listener = LocationListener::new(tx, self.clock.clone(), self.max_staleness);
        let id = self
            .source
            .request_updates(self.priority, listener.clone());
        let _subscription = Subscription {
            source: self.source.as_ref(),
            id,
            listener,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(position)) => Ok(position),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(?timeout, "timed out waiting for a location");
                Err(LocationError::NoFix(timeout))
            }
        }
    }

    fn is_fresh(&self, position: &Position) -> bool {
        position.age(self.clock.now()) <= self.max_staleness
    }
}

/// A fixed, user-configured position; used where there is no location hardware.
#[derive(Debug, Clone)]
pub struct StaticLocationSource {
    coordinates: Option<(f64, f64)>,
    clock: Arc<dyn Clock>,
}

impl StaticLocationSource {
    pub fn new(coordinates: Option<(f64, f64)>, clock: Arc<dyn Clock>) -> Self {
        Self { coordinates, clock }
    }

    fn position(&self) -> Option<Position> {
        self.coordinates
            .map(|(lat, lon)| Position::new(lat, lon, self.clock.now()))
    }
}

#[async_trait]
impl LocationSource for StaticLocationSource {
    fn has_permission(&self) -> bool {
        self.coordinates.is_some()
    }

    async fn last_known(&self) -> Option<Position> {
        self.position()
    }

    fn request_updates(&self, _priority: Priority, listener: LocationListener) -> SubscriptionId {
        if let Some(position) = self.position() {
            listener.on_location(position);
        }
        SubscriptionId(0)
    }

    fn remove_updates(&self, _id: SubscriptionId) {}
}
