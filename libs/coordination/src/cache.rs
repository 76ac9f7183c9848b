//! Process-local registry of live handles, used for revocation fan-out and
//! for sharing one permit pool size per semaphore entity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::lock::DistributedLock;
use crate::permits::PermitPoolSize;
use crate::reservation::ReservationType;
use crate::semaphore::Semaphore;

/// Identity of a handle within this process.
pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> HandleId {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cache key of lock handles: `{entity}/{PREFIX}`.
pub fn lock_key(entity_path: &str, reservation_type: ReservationType) -> String {
    format!("{entity_path}/{}", reservation_type.prefix())
}

#[derive(Debug, Default)]
pub struct CoordinationCache {
    locks: DashMap<String, Vec<Arc<dyn DistributedLock>>>,
    semaphores: DashMap<String, Vec<Arc<Semaphore>>>,
    permit_pools: DashMap<String, Arc<dyn PermitPoolSize>>,
}

impl CoordinationCache {
    pub fn put_lock(&self, lock: Arc<dyn DistributedLock>) {
        let key = lock_key(lock.entity_path(), lock.reservation_type());
        let mut entry = self.locks.entry(key).or_default();
        if !entry.iter().any(|l| l.handle_id() == lock.handle_id()) {
            entry.push(lock);
        }
    }

    /// Live lock handles of one entity and reservation type.
    pub fn locks(&self, entity_path: &str, reservation_type: ReservationType) -> Vec<Arc<dyn DistributedLock>> {
        self.locks
            .get(&lock_key(entity_path, reservation_type))
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    pub fn remove_lock(
        &self,
        entity_path: &str,
        reservation_type: ReservationType,
        handle_id: HandleId,
    ) -> bool {
        let key = lock_key(entity_path, reservation_type);
        let Entry::Occupied(mut entry) = self.locks.entry(key) else {
            return false;
        };
        let before = entry.get().len();
        entry.get_mut().retain(|l| l.handle_id() != handle_id);
        let removed = entry.get().len() != before;
        if entry.get().is_empty() {
            entry.remove();
        }
        removed
    }

    pub fn put_semaphore(&self, semaphore: Arc<Semaphore>) {
        let mut entry = self
            .semaphores
            .entry(semaphore.entity_path().to_owned())
            .or_default();
        if !entry.iter().any(|s| s.handle_id() == semaphore.handle_id()) {
            entry.push(semaphore);
        }
    }

    pub fn semaphores(&self, entity_path: &str) -> Vec<Arc<Semaphore>> {
        self.semaphores
            .get(entity_path)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// Removes a semaphore handle; returns how many handles remain for the entity.
    pub fn remove_semaphore(&self, entity_path: &str, handle_id: HandleId) -> usize {
        let Entry::Occupied(mut entry) = self.semaphores.entry(entity_path.to_owned()) else {
            return 0;
        };
        entry.get_mut().retain(|s| s.handle_id() != handle_id);
        let remaining = entry.get().len();
        if remaining == 0 {
            entry.remove();
        }
        remaining
    }

    pub fn permit_pool_size(&self, entity_path: &str) -> Option<Arc<dyn PermitPoolSize>> {
        self.permit_pools.get(entity_path).map(|p| p.value().clone())
    }

    /// Returns the cached pool size of the entity, caching `pool` if there is
    /// none. A cached pool of a different implementation is a configuration
    /// error.
    pub fn put_or_return_cached_permit_pool_size(
        &self,
        entity_path: &str,
        pool: Arc<dyn PermitPoolSize>,
    ) -> CoordResult<Arc<dyn PermitPoolSize>> {
        match self.permit_pools.entry(entity_path.to_owned()) {
            Entry::Occupied(entry) => {
                let cached = entry.get();
                if cached.kind() != pool.kind() {
                    return Err(CoordError::PermitPoolMismatch {
                        entity_path: entity_path.to_owned(),
                        cached: cached.kind(),
                        requested: pool.kind(),
                    });
                }
                debug!(entity_path, kind = cached.kind(), "reusing cached permit pool size");
                Ok(cached.clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    pub fn remove_permit_pool_size(&self, entity_path: &str) -> Option<Arc<dyn PermitPoolSize>> {
        self.permit_pools.remove(entity_path).map(|(_, pool)| pool)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.iter().map(|l| l.value().len()).sum()
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.iter().map(|s| s.value().len()).sum()
    }
}
