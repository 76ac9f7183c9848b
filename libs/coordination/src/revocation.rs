//! Revocation observers: learn that a held reservation was deleted out of
//! band and invalidate the local handle that held it.
//!
//! Both observers diff the children of an entity. Every vanished child is
//! matched against the live handles in the [`CoordinationCache`]; a match is
//! revoked locally and reported to the user callback. Ordinary releases never
//! match because the handle forgets its reservation before deleting it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use coord_store::path::join;
use tracing::warn;

use crate::cache::CoordinationCache;
use crate::lock::DistributedLock;
use crate::metrics::CoordMetrics;
use crate::observer::{Observer, ObserverId};
use crate::reservation::ReservationType;
use crate::semaphore::Semaphore;

/// Absolute paths of the children in `previous` that are missing from
/// `updated`, in name order.
pub fn find_revoked(updated: &[String], previous: &[String], entity_path: &str) -> Vec<String> {
    let current: HashSet<&str> = updated.iter().map(String::as_str).collect();
    let mut revoked: Vec<String> = previous
        .iter()
        .filter(|c| !current.contains(c.as_str()))
        .map(|c| join(entity_path, c))
        .collect();
    revoked.sort_unstable();
    revoked
}

/// Identifies a registered revocation observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverRegistration {
    pub entity_path: String,
    pub observer_id: ObserverId,
}

type LockRevokedFn = dyn Fn(&Arc<dyn DistributedLock>, &str) + Send + Sync;
type PermitRevokedFn = dyn Fn(&Arc<Semaphore>, &str) + Send + Sync;

/// Reports revoked lock holds of one lock entity, exclusive and shared.
#[derive(Clone)]
pub struct LockObserver {
    owner_id: Option<String>,
    revoked: Arc<LockRevokedFn>,
}

impl fmt::Debug for LockObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockObserver")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl LockObserver {
    pub fn new(revoked: impl Fn(&Arc<dyn DistributedLock>, &str) + Send + Sync + 'static) -> Self {
        Self {
            owner_id: None,
            revoked: Arc::new(revoked),
        }
    }

    /// Scopes the observer to an owner so it can be removed with the owner's
    /// other observers.
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Revokes every cached lock handle holding one of `revoked_ids`.
    pub(crate) fn signal(
        &self,
        cache: &CoordinationCache,
        metrics: &CoordMetrics,
        entity_path: &str,
        revoked_ids: &[String],
    ) -> usize {
        let mut signalled = 0;
        for reservation_type in [ReservationType::LockExclusive, ReservationType::LockShared] {
            for lock in cache.locks(entity_path, reservation_type) {
                let Some(held) = lock.lock_id() else {
                    continue;
                };
                if revoked_ids.contains(&held) && lock.revoke(&held) {
                    warn!(reservation_path = %held, "held lock reservation revoked");
                    metrics.revoked("lock");
                    (self.revoked)(&lock, &held);
                    signalled += 1;
                }
            }
        }
        signalled
    }

    pub(crate) fn into_observer(
        self,
        entity_path: &str,
        cache: Arc<CoordinationCache>,
        metrics: CoordMetrics,
    ) -> Arc<Observer> {
        let mut builder = Observer::builder();
        if let Some(owner) = &self.owner_id {
            builder = builder.owner(owner.clone());
        }
        let entity_path = entity_path.to_owned();
        builder
            .on_children_changed(move |updated, previous| {
                let revoked = find_revoked(updated, previous, &entity_path);
                if !revoked.is_empty() {
                    self.signal(&cache, &metrics, &entity_path, &revoked);
                }
            })
            .build()
    }
}

/// Reports revoked permits of one semaphore entity.
#[derive(Clone)]
pub struct SemaphoreObserver {
    owner_id: Option<String>,
    revoked: Arc<PermitRevokedFn>,
}

impl fmt::Debug for SemaphoreObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreObserver")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl SemaphoreObserver {
    pub fn new(revoked: impl Fn(&Arc<Semaphore>, &str) + Send + Sync + 'static) -> Self {
        Self {
            owner_id: None,
            revoked: Arc::new(revoked),
        }
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub(crate) fn signal(
        &self,
        cache: &CoordinationCache,
        metrics: &CoordMetrics,
        entity_path: &str,
        revoked_ids: &[String],
    ) -> usize {
        let mut signalled = 0;
        for semaphore in cache.semaphores(entity_path) {
            for permit_id in revoked_ids {
                if semaphore.revoke(permit_id) {
                    warn!(reservation_path = %permit_id, "held permit revoked");
                    metrics.revoked("semaphore");
                    (self.revoked)(&semaphore, permit_id);
                    signalled += 1;
                }
            }
        }
        signalled
    }

    pub(crate) fn into_observer(
        self,
        entity_path: &str,
        cache: Arc<CoordinationCache>,
        metrics: CoordMetrics,
    ) -> Arc<Observer> {
        let mut builder = Observer::builder();
        if let Some(owner) = &self.owner_id {
            builder = builder.owner(owner.clone());
        }
        let entity_path = entity_path.to_owned();
        builder
            .on_children_changed(move |updated, previous| {
                let revoked = find_revoked(updated, previous, &entity_path);
                if !revoked.is_empty() {
                    self.signal(&cache, &metrics, &entity_path, &revoked);
                }
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use coord_store::{Acl, MemoryStore, StoreClient};

    use super::*;
    use crate::config::{CoordConfig, ObserverConfig};
    use crate::lock::ReentrantLock;
    use crate::manager::ReservationManager;
    use crate::observer::ObserverDispatch;
    use crate::permits::ConstantPermitPoolSize;

    #[test]
    fn test_find_revoked() {
        let previous = vec!["EX_0000000002".to_owned(), "EX_0000000001".to_owned()];
        let updated = vec!["EX_0000000002".to_owned(), "EX_0000000003".to_owned()];
        assert_eq!(
            find_revoked(&updated, &previous, "/e"),
            vec!["/e/EX_0000000001".to_owned()]
        );
        assert!(find_revoked(&previous, &previous, "/e").is_empty());
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lock_observer_revokes_deleted_hold() {
        let store = MemoryStore::new();
        let client = store.connect();
        let metrics = CoordMetrics::unregistered();
        let cache = Arc::new(CoordinationCache::default());
        let manager = Arc::new(ReservationManager::new(
            Arc::new(client.clone()),
            cache.clone(),
            &CoordConfig::default(),
            metrics.clone(),
        ));
        let observers = ObserverDispatch::new(
            Arc::new(client.clone()),
            ObserverConfig::default(),
            metrics.clone(),
        );
        let entity = "/q/coord/c/lock/e";
        let lock: Arc<dyn DistributedLock> = Arc::new(ReentrantLock::new(
            manager.clone(),
            "a",
            entity,
            ReservationType::LockExclusive,
            Acl::open_unsafe(),
        ));
        cache.put_lock(lock.clone());
        lock.lock().await.unwrap();
        let held = lock.lock_id().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let seen = seen.clone();
            LockObserver::new(move |_, id| seen.lock().unwrap().push(id.to_owned()))
        };
        observers
            .put(entity, observer.into_observer(entity, cache.clone(), metrics.clone()))
            .await;

        client.delete(&held, None).await.unwrap();
        eventually(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec![held]);
        assert!(lock.is_revoked());
        assert_eq!(metrics.revocations.with_label_values(&["lock"]).get(), 1);
    }

    #[tokio::test]
    async fn test_semaphore_observer_revokes_only_vanished_permit() {
        let store = MemoryStore::new();
        let client = store.connect();
        let metrics = CoordMetrics::unregistered();
        let cache = Arc::new(CoordinationCache::default());
        let manager = Arc::new(ReservationManager::new(
            Arc::new(client.clone()),
            cache.clone(),
            &CoordConfig::default(),
            metrics.clone(),
        ));
        let entity = "/q/coord/c/semaphore/s";
        let semaphore = Arc::new(Semaphore::new(
            manager,
            "a",
            entity,
            Acl::open_unsafe(),
            Arc::new(ConstantPermitPoolSize::new(3).unwrap()),
        ));
        cache.put_semaphore(semaphore.clone());
        let permits = semaphore.try_acquire_n(2).await.unwrap().unwrap();

        let observer = SemaphoreObserver::new(|_, _| {});
        let revoked = vec![permits[0].clone()];
        assert_eq!(observer.signal(&cache, &metrics, entity, &revoked), 1);
        assert!(semaphore.is_revoked(&permits[0]));
        assert!(!semaphore.is_revoked(&permits[1]));
        // a second signal for the same permit is a no-op
        assert_eq!(observer.signal(&cache, &metrics, entity, &revoked), 0);
    }
}
