//! Counting semaphore over the reservation manager.
//!
//! Admission is re-derived from the live sibling list on every scan, so there
//! is no permit counter to keep in sync with the store. Permits are identified
//! by their reservation path.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use coord_store::Acl;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{HandleId, next_handle_id};
use crate::error::{CoordError, CoordResult};
use crate::manager::{AcquireRequest, Acquisition, ReservationManager};
use crate::permits::PermitPoolSize;
use crate::reservation::ReservationType;

pub struct Semaphore {
    id: HandleId,
    manager: Arc<ReservationManager>,
    owner_id: String,
    entity_path: String,
    acl: Vec<Acl>,
    pool: Arc<dyn PermitPoolSize>,
    acquired: Mutex<Vec<String>>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("entity_path", &self.entity_path)
            .field("pool", &self.pool)
            .field("acquired", &*self.held())
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub(crate) fn new(
        manager: Arc<ReservationManager>,
        owner_id: impl Into<String>,
        entity_path: impl Into<String>,
        acl: Vec<Acl>,
        pool: Arc<dyn PermitPoolSize>,
    ) -> Self {
        Self {
            id: next_handle_id(),
            manager,
            owner_id: owner_id.into(),
            entity_path: entity_path.into(),
            acl,
            pool,
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn pool(&self) -> &Arc<dyn PermitPoolSize> {
        &self.pool
    }

    pub fn permit_pool_size(&self) -> usize {
        self.pool.get()
    }

    fn held(&self) -> MutexGuard<'_, Vec<String>> {
        self.acquired.lock().expect("semaphore state poisoned")
    }

    /// Permit ids currently held by this handle, in acquisition order.
    pub fn acquired_permit_ids(&self) -> Vec<String> {
        self.held().clone()
    }

    pub fn is_revoked(&self, permit_id: &str) -> bool {
        !self.held().iter().any(|p| p == permit_id)
    }

    /// Forgets a held permit without touching the store.
    pub fn revoke(&self, permit_id: &str) -> bool {
        let mut held = self.held();
        let before = held.len();
        held.retain(|p| p != permit_id);
        let revoked = held.len() != before;
        if revoked {
            info!(reservation_path = permit_id, "permit revoked");
        }
        revoked
    }

    /// Pool size minus every queued reservation (holders and waiters), at least 0.
    pub async fn available_permits(&self) -> CoordResult<usize> {
        let queued = self.manager.reservation_list(&self.entity_path).await?.len();
        Ok(self.pool.get().saturating_sub(queued))
    }

    /// Acquires `permits` tickets one after another. Anything short of all of
    /// them rolls back the permits obtained by this call only.
    async fn obtain(
        &self,
        permits: usize,
        wait: Option<Duration>,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<Option<Vec<String>>> {
        let deadline = wait.map(|w| Instant::now() + w);
        let mut obtained = Vec::with_capacity(permits);
        for _ in 0..permits {
            let req = AcquireRequest {
                owner_id: &self.owner_id,
                entity_path: &self.entity_path,
                reservation_type: ReservationType::Semaphore,
                acl: &self.acl,
                wait: deadline.map(|d| d.saturating_duration_since(Instant::now())),
                interrupt,
                interruptible: interrupt.is_some(),
            };
            match self.manager.acquire_permit(&req, self.pool.as_ref()).await {
                Ok(Acquisition::Acquired(path)) => obtained.push(path),
                Ok(Acquisition::TimedOut { ticket }) => {
                    if let Err(err) = self.manager.relinquish(&ticket).await {
                        warn!(
                            reservation_path = %ticket,
                            error = %err,
                            "could not remove ticket of failed attempt"
                        );
                    }
                    self.roll_back(&obtained).await;
                    return Ok(None);
                }
                Ok(Acquisition::Failed) => {
                    self.roll_back(&obtained).await;
                    return Ok(None);
                }
                Err(err) => {
                    self.roll_back(&obtained).await;
                    return Err(err);
                }
            }
        }
        self.held().extend(obtained.iter().cloned());
        Ok(Some(obtained))
    }

    async fn roll_back(&self, obtained: &[String]) {
        if obtained.is_empty() {
            return;
        }
        debug!(
            entity_path = %self.entity_path,
            permits = obtained.len(),
            "returning permits of incomplete acquisition"
        );
        for path in obtained {
            if let Err(err) = self.manager.relinquish(path).await {
                warn!(reservation_path = %path, error = %err, "could not return permit");
            }
        }
    }

    fn single(&self, permits: Option<Vec<String>>) -> CoordResult<String> {
        permits
            .and_then(|mut p| p.pop())
            .ok_or_else(|| CoordError::NotAcquired(self.entity_path.clone()))
    }

    fn all(&self, permits: Option<Vec<String>>) -> CoordResult<Vec<String>> {
        permits.ok_or_else(|| CoordError::NotAcquired(self.entity_path.clone()))
    }

    /// Waits for one permit; cancelling `interrupt` returns
    /// [`CoordError::Interrupted`].
    pub async fn acquire(&self, interrupt: &CancellationToken) -> CoordResult<String> {
        let permits = self.obtain(1, None, Some(interrupt)).await?;
        self.single(permits)
    }

    /// Waits for `permits` permits. On interruption only the permits obtained
    /// by this call are returned; earlier holds are kept.
    pub async fn acquire_n(
        &self,
        permits: usize,
        interrupt: &CancellationToken,
    ) -> CoordResult<Vec<String>> {
        let permits = self.obtain(permits, None, Some(interrupt)).await?;
        self.all(permits)
    }

    pub async fn acquire_uninterruptibly(&self) -> CoordResult<String> {
        let permits = self.obtain(1, None, None).await?;
        self.single(permits)
    }

    pub async fn acquire_uninterruptibly_n(&self, permits: usize) -> CoordResult<Vec<String>> {
        let permits = self.obtain(permits, None, None).await?;
        self.all(permits)
    }

    /// One permit if one is free right now. Never barges ahead of waiters.
    pub async fn try_acquire(&self) -> CoordResult<Option<String>> {
        Ok(self.try_acquire_n(1).await?.and_then(|mut p| p.pop()))
    }

    pub async fn try_acquire_n(&self, permits: usize) -> CoordResult<Option<Vec<String>>> {
        if self.available_permits().await? < permits {
            return Ok(None);
        }
        self.obtain(permits, Some(Duration::ZERO), None).await
    }

    pub async fn try_acquire_for(
        &self,
        wait: Duration,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<Option<String>> {
        Ok(self
            .obtain(1, Some(wait), interrupt)
            .await?
            .and_then(|mut p| p.pop()))
    }

    /// All-or-nothing within one shared `wait` budget.
    pub async fn try_acquire_n_for(
        &self,
        permits: usize,
        wait: Duration,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<Option<Vec<String>>> {
        self.obtain(permits, Some(wait), interrupt).await
    }

    /// Takes every permit that is free right now and keeps them.
    pub async fn drain_permits(&self) -> CoordResult<Vec<String>> {
        let mut drained = Vec::new();
        if self.available_permits().await? == 0 {
            return Ok(drained);
        }
        while let Some(mut permit) = self.obtain(1, Some(Duration::ZERO), None).await? {
            drained.append(&mut permit);
        }
        Ok(drained)
    }

    /// Releases one held permit. A permit that could not be deleted stays held.
    pub async fn release(&self, permit_id: &str) -> CoordResult<()> {
        if !self.revoke_quietly(permit_id) {
            return Err(CoordError::NotHeld(permit_id.to_owned()));
        }
        if let Err(err) = self.manager.relinquish(permit_id).await {
            self.held().push(permit_id.to_owned());
            return Err(err);
        }
        Ok(())
    }

    /// Releases the given permits; returns how many were released.
    pub async fn release_ids(&self, permit_ids: &[String]) -> CoordResult<usize> {
        let mut released = 0;
        for permit_id in permit_ids {
            match self.release(permit_id).await {
                Ok(()) => released += 1,
                Err(CoordError::NotHeld(_)) => {}
                Err(err) => {
                    warn!(reservation_path = %permit_id, error = %err, "could not release permit");
                }
            }
        }
        if released < permit_ids.len() {
            warn!(
                entity_path = %self.entity_path,
                requested = permit_ids.len(),
                released,
                "released fewer permits than requested"
            );
        }
        Ok(released)
    }

    /// Releases the oldest held permit.
    pub async fn release_one(&self) -> CoordResult<()> {
        let oldest = self.held().first().cloned();
        match oldest {
            Some(permit_id) => self.release(&permit_id).await,
            None => Err(CoordError::NotHeld(self.entity_path.clone())),
        }
    }

    /// Releases up to `permits` held permits, oldest first.
    pub async fn release_n(&self, permits: usize) -> CoordResult<usize> {
        let chosen: Vec<String> = self.held().iter().take(permits).cloned().collect();
        self.release_ids(&chosen).await
    }

    fn revoke_quietly(&self, permit_id: &str) -> bool {
        let mut held = self.held();
        let before = held.len();
        held.retain(|p| p != permit_id);
        held.len() != before
    }

    /// Releases every held permit and unregisters the handle. The last handle
    /// of an entity also drops the shared pool size.
    pub async fn destroy(&self) -> CoordResult<()> {
        let held = self.acquired_permit_ids();
        let released = self.release_ids(&held).await?;
        let cache = self.manager.cache();
        if cache.remove_semaphore(&self.entity_path, self.id) == 0
            && let Some(pool) = cache.remove_permit_pool_size(&self.entity_path)
        {
            pool.close();
        }
        debug!(entity_path = %self.entity_path, released, "semaphore destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use coord_store::{MemoryClient, MemoryStore};

    use super::*;
    use crate::cache::CoordinationCache;
    use crate::config::CoordConfig;
    use crate::metrics::CoordMetrics;
    use crate::permits::ConstantPermitPoolSize;

    const ENTITY: &str = "/q/coord/c/semaphore/s";

    fn manager(client: &MemoryClient) -> Arc<ReservationManager> {
        let config = CoordConfig {
            relay_ceiling_ms: 2_000,
            ..CoordConfig::default()
        };
        Arc::new(ReservationManager::new(
            Arc::new(client.clone()),
            Arc::new(CoordinationCache::default()),
            &config,
            CoordMetrics::unregistered(),
        ))
    }

    fn semaphore(mgr: &Arc<ReservationManager>, owner: &str, size: usize) -> Semaphore {
        Semaphore::new(
            mgr.clone(),
            owner,
            ENTITY,
            Acl::open_unsafe(),
            Arc::new(ConstantPermitPoolSize::new(size).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_try_acquire_respects_pool() {
        let store = MemoryStore::new();
        let client = store.connect();
        let mgr = manager(&client);
        let a = semaphore(&mgr, "a", 2);
        let b = semaphore(&mgr, "b", 2);

        let first = a.try_acquire().await.unwrap().unwrap();
        assert_eq!(a.available_permits().await.unwrap(), 1);
        assert!(b.try_acquire().await.unwrap().is_some());
        assert!(b.try_acquire().await.unwrap().is_none());
        assert_eq!(a.available_permits().await.unwrap(), 0);
        assert_eq!(a.acquired_permit_ids(), vec![first.clone()]);

        a.release(&first).await.unwrap();
        assert!(a.is_revoked(&first));
        assert!(matches!(
            a.release(&first).await,
            Err(CoordError::NotHeld(_))
        ));
        assert!(b.try_acquire().await.unwrap().is_some());
        assert_eq!(b.acquired_permit_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_try_acquire_n_is_all_or_nothing() {
        let store = MemoryStore::new();
        let client = store.connect();
        let mgr = manager(&client);
        let a = semaphore(&mgr, "a", 3);

        assert!(a.try_acquire_n(4).await.unwrap().is_none());
        let permits = a.try_acquire_n(3).await.unwrap().unwrap();
        assert_eq!(permits.len(), 3);
        assert_eq!(a.release_n(2).await.unwrap(), 2);
        assert_eq!(a.acquired_permit_ids(), vec![permits[2].clone()]);

        let timed = a
            .try_acquire_n_for(3, Duration::from_millis(50), None)
            .await
            .unwrap();
        assert!(timed.is_none());
        // the timed attempt rolled back what it got; the earlier permit stays
        assert_eq!(mgr.reservation_list(ENTITY).await.unwrap().len(), 1);
        assert_eq!(a.acquired_permit_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_acquire_n_returns_only_its_permits() {
        let store = MemoryStore::new();
        let client = store.connect();
        let mgr = manager(&client);
        let a = Arc::new(semaphore(&mgr, "a", 2));
        let b = semaphore(&mgr, "b", 2);

        let earlier = a.acquire_uninterruptibly().await.unwrap();
        b.acquire_uninterruptibly().await.unwrap();
        let token = CancellationToken::new();
        let pending = {
            let a = a.clone();
            let token = token.clone();
            tokio::spawn(async move { a.acquire_n(2, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        b.release_one().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(a.acquired_permit_ids(), vec![earlier.clone()]);
        let list = mgr.reservation_list(ENTITY).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(earlier.ends_with(&list[0]));
    }

    #[tokio::test]
    async fn test_drain_and_revoke() {
        let store = MemoryStore::new();
        let client = store.connect();
        let mgr = manager(&client);
        let a = semaphore(&mgr, "a", 3);

        let drained = a.drain_permits().await.unwrap();
        assert_eq!(drained.len(), 3);
        assert!(a.drain_permits().await.unwrap().is_empty());

        assert!(a.revoke(&drained[0]));
        assert!(!a.revoke(&drained[0]));
        assert!(a.is_revoked(&drained[0]));
        assert_eq!(a.acquired_permit_ids().len(), 2);

        a.destroy().await.unwrap();
        // the revoked permit is no longer ours to release
        assert_eq!(mgr.reservation_list(ENTITY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_drops_shared_pool_with_last_handle() {
        let store = MemoryStore::new();
        let client = store.connect();
        let mgr = manager(&client);
        let cache = mgr.cache().clone();
        let pool: Arc<dyn PermitPoolSize> = Arc::new(ConstantPermitPoolSize::new(2).unwrap());
        let pool = cache
            .put_or_return_cached_permit_pool_size(ENTITY, pool)
            .unwrap();
        let a = Arc::new(Semaphore::new(mgr.clone(), "a", ENTITY, Acl::open_unsafe(), pool.clone()));
        let b = Arc::new(Semaphore::new(mgr.clone(), "b", ENTITY, Acl::open_unsafe(), pool));
        cache.put_semaphore(a.clone());
        cache.put_semaphore(b.clone());

        a.acquire_uninterruptibly().await.unwrap();
        a.destroy().await.unwrap();
        assert!(cache.permit_pool_size(ENTITY).is_some());
        assert!(mgr.reservation_list(ENTITY).await.unwrap().is_empty());

        b.destroy().await.unwrap();
        assert!(cache.permit_pool_size(ENTITY).is_none());
        assert_eq!(cache.semaphore_count(), 0);
    }
}
