//! Watch relay: the wakeup sink of one acquisition attempt loop.
//!
//! The relay is handed to the store as a custom watcher. Each arm registers a
//! one-shot watch; the store fires it on the next structural change of the
//! path or on any connectivity transition of the session. A notification that
//! arrives before the waiter parks is kept as a permit, so it is never lost.

use std::sync::Arc;
use std::time::Duration;

use coord_store::{Stat, StoreClient, StoreResult, Watch, WatchedEvent, Watcher};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics::CoordMetrics;

/// Why [`WatchRelay::wait_for_event`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The armed watch (or a connectivity transition) fired.
    Notified,
    /// The requested wait or the safety ceiling elapsed.
    TimedOut,
    /// The caller's interrupt token was cancelled.
    Interrupted,
    /// The owning manager is shutting down.
    ShutDown,
}

struct RelaySink {
    notify: Notify,
    entity_path: String,
}

impl Watcher for RelaySink {
    fn process(&self, event: &WatchedEvent) {
        trace!(
            entity_path = %self.entity_path,
            event_type = %event.event_type,
            state = %event.state,
            path = ?event.path,
            "relay notified"
        );
        self.notify.notify_one();
    }
}

pub struct WatchRelay {
    sink: Arc<RelaySink>,
    ceiling: Duration,
    metrics: CoordMetrics,
}

impl WatchRelay {
    pub fn new(entity_path: impl Into<String>, ceiling: Duration, metrics: CoordMetrics) -> Self {
        let entity_path = entity_path.into();
        metrics.relays_outstanding.inc();
        debug!(%entity_path, "relay created");
        Self {
            sink: Arc::new(RelaySink {
                notify: Notify::new(),
                entity_path,
            }),
            ceiling,
            metrics,
        }
    }

    /// Watch argument routing to this relay.
    pub fn watch(&self) -> Watch {
        Watch::Custom(self.sink.clone())
    }

    /// Arms an existence watch on `path`; returns its metadata if present.
    pub async fn arm_exists(&self, store: &dyn StoreClient, path: &str) -> StoreResult<Option<Stat>> {
        store.exists(path, self.watch()).await
    }

    /// Arms a child watch on `path` and returns the current children.
    pub async fn arm_children(&self, store: &dyn StoreClient, path: &str) -> StoreResult<Vec<String>> {
        store.get_children(path, self.watch()).await
    }

    /// Parks until notified, `wait` elapses (`None` means indefinitely), the
    /// safety ceiling elapses, `interrupt` fires or `shutdown` fires.
    pub async fn wait_for_event(
        &self,
        wait: Option<Duration>,
        interrupt: Option<&CancellationToken>,
        shutdown: &CancellationToken,
    ) -> WaitOutcome {
        let budget = wait.map_or(self.ceiling, |w| w.min(self.ceiling));
        if budget.is_zero() {
            return WaitOutcome::TimedOut;
        }
        let interrupted = async {
            match interrupt {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => WaitOutcome::ShutDown,
            _ = interrupted => WaitOutcome::Interrupted,
            _ = self.sink.notify.notified() => WaitOutcome::Notified,
            _ = tokio::time::sleep(budget) => {
                trace!(entity_path = %self.sink.entity_path, ?budget, "relay wait elapsed");
                WaitOutcome::TimedOut
            }
        }
    }

    /// Ends the attempt loop this relay served.
    pub fn destroy(self) {
        debug!(entity_path = %self.sink.entity_path, "relay destroyed");
    }
}

impl Drop for WatchRelay {
    fn drop(&mut self) {
        self.metrics.relays_outstanding.dec();
    }
}

impl std::fmt::Debug for WatchRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRelay")
            .field("entity_path", &self.sink.entity_path)
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use coord_store::{Acl, CreateMode, MemoryStore};

    use super::*;

    #[tokio::test]
    async fn test_zero_wait_returns_immediately() {
        let metrics = CoordMetrics::unregistered();
        let relay = WatchRelay::new("/e", Duration::from_secs(60), metrics.clone());
        let shutdown = CancellationToken::new();
        assert_eq!(
            relay
                .wait_for_event(Some(Duration::ZERO), None, &shutdown)
                .await,
            WaitOutcome::TimedOut
        );
        assert_eq!(metrics.relays_outstanding.get(), 1);
        relay.destroy();
        assert_eq!(metrics.relays_outstanding.get(), 0);
    }

    #[tokio::test]
    async fn test_ceiling_bounds_indefinite_wait() {
        let relay = WatchRelay::new(
            "/e",
            Duration::from_millis(20),
            CoordMetrics::unregistered(),
        );
        let shutdown = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay.wait_for_event(None, None, &shutdown),
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_notification_before_wait_is_kept() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/n", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let relay = WatchRelay::new("/n", Duration::from_secs(60), CoordMetrics::unregistered());
        assert!(relay.arm_exists(&client, "/n").await.unwrap().is_some());
        client.delete("/n", None).await.unwrap();
        // let the delivery task run before parking
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay.wait_for_event(None, None, &shutdown),
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Notified);
    }

    #[tokio::test]
    async fn test_children_watch_wakes_waiter() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/p", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let relay = WatchRelay::new("/p", Duration::from_secs(60), CoordMetrics::unregistered());
        assert!(relay.arm_children(&client, "/p").await.unwrap().is_empty());

        let writer = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .create("/p/c", b"", &Acl::open_unsafe(), CreateMode::Persistent)
                .await
                .unwrap();
        });
        let shutdown = CancellationToken::new();
        assert_eq!(
            relay.wait_for_event(None, None, &shutdown).await,
            WaitOutcome::Notified
        );
    }

    #[tokio::test]
    async fn test_interrupt_and_shutdown() {
        let relay = WatchRelay::new("/e", Duration::from_secs(60), CoordMetrics::unregistered());
        let shutdown = CancellationToken::new();
        let interrupt = CancellationToken::new();
        interrupt.cancel();
        assert_eq!(
            relay
                .wait_for_event(None, Some(&interrupt), &shutdown)
                .await,
            WaitOutcome::Interrupted
        );
        shutdown.cancel();
        assert_eq!(
            relay
                .wait_for_event(None, Some(&interrupt), &shutdown)
                .await,
            WaitOutcome::ShutDown
        );
    }
}
