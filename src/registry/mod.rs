//! Address registry
//!
//! Correlates accepted connections with destination notifications. Each
//! correlation key is a one-shot rendezvous: whichever side arrives first
//! parks its half (a stored notification, or a waiting oneshot sender) and
//! the other side completes the match and removes the entry. Registration
//! happens from the single reader task; many forwarding tasks may await
//! different keys concurrently.

use crate::notify::DestNotification;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

enum Slot {
    /// Notification arrived before the connection was accepted
    Ready {
        notification: DestNotification,
        registered_at: Instant,
    },
    /// A forwarding task is parked waiting for the notification
    Waiting(oneshot::Sender<DestNotification>),
}

/// Concurrent key -> notification rendezvous with bounded entry lifetime
#[derive(Default)]
pub struct AddressRegistry {
    slots: DashMap<u16, Slot>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        AddressRegistry {
            slots: DashMap::new(),
        }
    }

    /// Publish a notification. Wakes the waiting task for this key if there
    /// is one; otherwise parks the notification until a connection claims
    /// it or it expires. A key that already holds an unmatched notification
    /// is a duplicate and is never overwritten.
    pub fn register(&self, notification: DestNotification) -> Result<()> {
        let key = notification.key;
        match self.slots.entry(key) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Ready { .. } => Err(Error::DuplicateNotification(key)),
                Slot::Waiting(_) => {
                    if let Slot::Waiting(tx) = occupied.remove() {
                        if tx.send(notification).is_err() {
                            // Waiter timed out between insert and send
                            trace!("waiter for key {} already gone", key);
                        }
                    }
                    Ok(())
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Ready {
                    notification,
                    registered_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Wait for the notification for `key`, at most `wait`. Completes
    /// immediately if it was registered first. Each notification can be
    /// claimed exactly once.
    pub async fn await_match(&self, key: u16, wait: Duration) -> Result<DestNotification> {
        let rx = match self.slots.entry(key) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Ready { .. } => {
                    if let Slot::Ready { notification, .. } = occupied.remove() {
                        return Ok(notification);
                    }
                    unreachable!("slot changed under entry guard");
                }
                // Two accepted connections computed the same key; only the
                // first may claim the notification.
                Slot::Waiting(_) => {
                    return Err(Error::internal(format!(
                        "correlation key {} already awaited",
                        key
                    )))
                }
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(Slot::Waiting(tx));
                rx
            }
        };

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(notification)) => Ok(notification),
            // Sender dropped without sending: the entry is already gone
            Ok(Err(_)) => Err(Error::CorrelationTimeout {
                key,
                waited_ms: wait.as_millis() as u64,
            }),
            Err(_) => {
                // Remove our parked waiter; a concurrent register may have
                // just claimed it, in which case the slot is already gone.
                self.slots
                    .remove_if(&key, |_, slot| matches!(slot, Slot::Waiting(_)));
                Err(Error::CorrelationTimeout {
                    key,
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Number of entries currently parked (either direction)
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Drop unmatched notifications older than `ttl`. Waiting entries are
    /// left alone; their timeout cleans them up.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready { registered_at, .. } => registered_at.elapsed() < ttl,
            Slot::Waiting(_) => true,
        });
        let evicted = before - self.slots.len();
        if evicted > 0 {
            warn!("evicted {} expired notification(s)", evicted);
        }
        evicted
    }

    /// Spawn the periodic eviction task. Aborted by the dispatcher on
    /// shutdown.
    pub fn start_sweeper(self: Arc<Self>, ttl: Duration) -> JoinHandle<()> {
        let registry = self;
        let period = (ttl / 2).max(Duration::from_millis(500));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep(ttl);
                if evicted > 0 {
                    debug!("{} notification(s) still pending", registry.pending());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(key: u16) -> DestNotification {
        DestNotification {
            key,
            pid: 999,
            fd: 5,
            dest: "203.0.113.77:8443".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_register_then_await() {
        let registry = AddressRegistry::new();
        registry.register(notification(100)).unwrap();

        let n = registry
            .await_match(100, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(n.key, 100);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_await_then_register() {
        let registry = Arc::new(AddressRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_match(200, Duration::from_secs(1)).await })
        };

        // Let the waiter park first
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(notification(200)).unwrap();

        let n = waiter.await.unwrap().unwrap();
        assert_eq!(n.key, 200);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_await_times_out_and_cleans_up() {
        let registry = AddressRegistry::new();
        let started = Instant::now();
        let err = registry
            .await_match(300, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorrelationTimeout { key: 300, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_error() {
        let registry = AddressRegistry::new();
        registry.register(notification(400)).unwrap();
        let err = registry.register(notification(400)).unwrap_err();
        assert!(matches!(err, Error::DuplicateNotification(400)));

        // Original entry untouched
        let n = registry
            .await_match(400, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(n.key, 400);
    }

    #[tokio::test]
    async fn test_notification_claimed_at_most_once() {
        let registry = AddressRegistry::new();
        registry.register(notification(500)).unwrap();

        registry
            .await_match(500, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(registry
            .await_match(500, Duration::from_millis(10))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_second_waiter_fails_without_killing_the_first() {
        let registry = Arc::new(AddressRegistry::new());
        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_match(700, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Only one connection may claim a key; the loser is dropped alone
        let err = registry
            .await_match(700, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_per_connection());

        registry.register(notification(700)).unwrap();
        assert_eq!(first.await.unwrap().unwrap().key, 700);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired() {
        let registry = AddressRegistry::new();
        registry.register(notification(600)).unwrap();

        assert_eq!(registry.sweep(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.sweep(Duration::from_millis(10)), 1);

        // Evicted entries can never match
        assert!(registry
            .await_match(600, Duration::from_millis(10))
            .await
            .is_err());
    }
}
