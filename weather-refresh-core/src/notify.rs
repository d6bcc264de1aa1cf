//! Process-local "record changed" events.
//!
//! Events carry only the provider id; consumers re-read the store. A
//! subscriber owns its [`Subscription`] and stops listening by dropping it
//! or calling [`Subscription::cancel`].

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::provider::ProviderId;

const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub provider: ProviderId,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget. Returns how many subscribers were reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!(provider = %event.provider, "change event with no subscribers");
                0
            }
        }
    }

    /// Every provider's events.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    /// Only events for `provider`.
    pub fn subscribe_to(&self, provider: ProviderId) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: Some(provider),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: Option<ProviderId>,
}

impl Subscription {
    /// Next matching event, or `None` once every [`Notifier`] is gone.
    ///
    /// A subscriber that fell behind gets the next event it can still see;
    /// since events carry no data, nothing is lost by skipping.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "change subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Stop listening. Same as dropping the handle.
    pub fn cancel(self) {}

    fn matches(&self, event: &ChangeEvent) -> bool {
        self.filter.is_none_or(|provider| provider == event.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OW: ChangeEvent = ChangeEvent {
        provider: ProviderId::OpenWeather,
    };
    const PW: ChangeEvent = ChangeEvent {
        provider: ProviderId::PirateWeather,
    };

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = Notifier::new();
        let mut all = notifier.subscribe();
        let mut only_pw = notifier.subscribe_to(ProviderId::PirateWeather);

        assert_eq!(notifier.publish(OW), 2);
        assert_eq!(notifier.publish(PW), 2);

        assert_eq!(all.recv().await, Some(OW));
        assert_eq!(all.recv().await, Some(PW));
        assert_eq!(only_pw.recv().await, Some(PW));
        assert_eq!(only_pw.try_recv(), None);
    }

    #[test]
    fn cancel_and_drop_unsubscribe() {
        let notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        a.cancel();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(b);
        assert_eq!(notifier.subscriber_count(), 0);
        assert_eq!(notifier.publish(OW), 0);
    }

    #[test]
    fn lagging_subscriber_keeps_receiving() {
        let notifier = Notifier::with_capacity(2);
        let mut sub = notifier.subscribe();
        for _ in 0..5 {
            notifier.publish(OW);
        }
        assert_eq!(sub.try_recv(), Some(OW));
    }

    #[tokio::test]
    async fn recv_ends_when_notifier_dropped() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe();
        drop(notifier);
        assert_eq!(sub.recv().await, None);
    }
}
