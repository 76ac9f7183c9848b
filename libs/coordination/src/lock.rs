//! Lock handles over the reservation manager.
//!
//! A handle holds at most one reservation path. [`Lock`] is a plain mutex: a
//! second `lock()` on a held handle waits for its own `unlock()`, while
//! `try_lock` on a held handle reports the existing hold without taking
//! another.
//! [`ReentrantLock`] counts nested holds and only touches the store on the
//! 0 → 1 and 1 → 0 transitions. [`ReadWriteLock`] pairs a shared and an
//! exclusive reentrant lock on the same entity.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use coord_store::Acl;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{HandleId, next_handle_id};
use crate::error::{CoordError, CoordResult};
use crate::manager::{AcquireRequest, Acquisition, ReservationManager};
use crate::reservation::ReservationType;

#[async_trait]
pub trait DistributedLock: Send + Sync + fmt::Debug {
    fn handle_id(&self) -> HandleId;

    fn entity_path(&self) -> &str;

    fn reservation_type(&self) -> ReservationType;

    /// Path of the held reservation, if any.
    fn lock_id(&self) -> Option<String>;

    /// True while the handle holds nothing, including after revocation.
    fn is_revoked(&self) -> bool;

    /// Drops the local hold if it is `reservation_id`. Does not touch the store.
    fn revoke(&self, reservation_id: &str) -> bool;

    /// Waits indefinitely, ignoring interruption. Fails only when the attempt
    /// is abandoned (shutdown, store failure) or on fatal errors.
    async fn lock(&self) -> CoordResult<()>;

    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> CoordResult<()>;

    /// Single scan; `false` under contention, `true` if this handle already
    /// holds the lock.
    async fn try_lock(&self) -> CoordResult<bool>;

    /// Waits at most `wait`; interruptible when a token is given.
    async fn try_lock_for(
        &self,
        wait: Duration,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<bool>;

    async fn unlock(&self) -> CoordResult<()>;

    /// Releases any hold and unregisters the handle.
    async fn destroy(&self) -> CoordResult<()>;
}

/// Identity and store access shared by the lock handles.
struct LockCore {
    id: HandleId,
    manager: Arc<ReservationManager>,
    owner_id: String,
    entity_path: String,
    reservation_type: ReservationType,
    acl: Vec<Acl>,
}

impl LockCore {
    fn new(
        manager: Arc<ReservationManager>,
        owner_id: String,
        entity_path: String,
        reservation_type: ReservationType,
        acl: Vec<Acl>,
    ) -> Self {
        Self {
            id: next_handle_id(),
            manager,
            owner_id,
            entity_path,
            reservation_type,
            acl,
        }
    }

    /// Runs one manager acquisition. A ticket left behind by a failed attempt
    /// is relinquished here.
    async fn acquire(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<Option<String>> {
        let req = AcquireRequest {
            owner_id: &self.owner_id,
            entity_path: &self.entity_path,
            reservation_type: self.reservation_type,
            acl: &self.acl,
            wait: deadline.map(|d| d.saturating_duration_since(Instant::now())),
            interrupt,
            interruptible: interrupt.is_some(),
        };
        match self.manager.acquire(&req).await? {
            Acquisition::Acquired(path) => Ok(Some(path)),
            Acquisition::TimedOut { ticket } => {
                if let Err(err) = self.manager.relinquish(&ticket).await {
                    warn!(
                        reservation_path = %ticket,
                        error = %err,
                        "could not remove ticket of failed attempt"
                    );
                }
                Ok(None)
            }
            Acquisition::Failed => Ok(None),
        }
    }

    fn not_acquired(&self) -> CoordError {
        CoordError::NotAcquired(self.entity_path.clone())
    }

    fn not_held(&self) -> CoordError {
        CoordError::NotHeld(self.entity_path.clone())
    }
}

fn deadline_after(wait: Option<Duration>) -> Option<Instant> {
    wait.map(|w| Instant::now() + w)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(interrupt: Option<&CancellationToken>) {
    match interrupt {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Serializes local acquisitions of one handle. `None` when the deadline
/// passed first.
async fn enter_gate<'a>(
    gate: &'a tokio::sync::Mutex<()>,
    deadline: Option<Instant>,
    interrupt: Option<&CancellationToken>,
    entity_path: &str,
) -> CoordResult<Option<tokio::sync::MutexGuard<'a, ()>>> {
    tokio::select! {
        biased;
        guard = gate.lock() => Ok(Some(guard)),
        _ = cancelled(interrupt) => Err(CoordError::Interrupted(entity_path.to_owned())),
        _ = until(deadline) => Ok(None),
    }
}

/// Non-reentrant distributed mutex.
pub struct Lock {
    core: LockCore,
    acquired: Mutex<Option<String>>,
    gate: tokio::sync::Mutex<()>,
    released: Notify,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.core.id)
            .field("entity_path", &self.core.entity_path)
            .field("reservation_type", &self.core.reservation_type)
            .field("acquired", &*self.acquired())
            .finish_non_exhaustive()
    }
}

impl Lock {
    pub(crate) fn new(
        manager: Arc<ReservationManager>,
        owner_id: impl Into<String>,
        entity_path: impl Into<String>,
        reservation_type: ReservationType,
        acl: Vec<Acl>,
    ) -> Self {
        Self {
            core: LockCore::new(
                manager,
                owner_id.into(),
                entity_path.into(),
                reservation_type,
                acl,
            ),
            acquired: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            released: Notify::new(),
        }
    }

    fn acquired(&self) -> MutexGuard<'_, Option<String>> {
        self.acquired.lock().expect("lock state poisoned")
    }

    /// With `held_ok` a handle that already holds the lock succeeds at once
    /// instead of waiting for its own unlock.
    async fn acquire_local(
        &self,
        wait: Option<Duration>,
        interrupt: Option<&CancellationToken>,
        held_ok: bool,
    ) -> CoordResult<bool> {
        let deadline = deadline_after(wait);
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let Some(gate) = enter_gate(&self.gate, deadline, interrupt, &self.core.entity_path).await?
            else {
                return Ok(false);
            };
            if self.acquired().is_none() {
                let path = self.core.acquire(deadline, interrupt).await?;
                let acquired = path.is_some();
                *self.acquired() = path;
                return Ok(acquired);
            }
            drop(gate);
            if held_ok {
                return Ok(true);
            }

            debug!(
                entity_path = %self.core.entity_path,
                "handle already holds the lock, waiting for unlock"
            );
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Ok(false);
            }
            tokio::select! {
                biased;
                _ = cancelled(interrupt) => {
                    return Err(CoordError::Interrupted(self.core.entity_path.clone()));
                }
                _ = &mut released => {}
                _ = until(deadline) => return Ok(false),
            }
        }
    }
}

#[async_trait]
impl DistributedLock for Lock {
    fn handle_id(&self) -> HandleId {
        self.core.id
    }

    fn entity_path(&self) -> &str {
        &self.core.entity_path
    }

    fn reservation_type(&self) -> ReservationType {
        self.core.reservation_type
    }

    fn lock_id(&self) -> Option<String> {
        self.acquired().clone()
    }

    fn is_revoked(&self) -> bool {
        self.acquired().is_none()
    }

    fn revoke(&self, reservation_id: &str) -> bool {
        let mut acquired = self.acquired();
        if acquired.as_deref() != Some(reservation_id) {
            return false;
        }
        *acquired = None;
        drop(acquired);
        self.released.notify_waiters();
        info!(reservation_path = reservation_id, "lock revoked");
        true
    }

    async fn lock(&self) -> CoordResult<()> {
        if self.acquire_local(None, None, false).await? {
            Ok(())
        } else {
            Err(self.core.not_acquired())
        }
    }

    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> CoordResult<()> {
        if self.acquire_local(None, Some(interrupt), false).await? {
            Ok(())
        } else {
            Err(self.core.not_acquired())
        }
    }

    async fn try_lock(&self) -> CoordResult<bool> {
        self.acquire_local(Some(Duration::ZERO), None, true).await
    }

    async fn try_lock_for(
        &self,
        wait: Duration,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<bool> {
        self.acquire_local(Some(wait), interrupt, true).await
    }

    async fn unlock(&self) -> CoordResult<()> {
        let Some(path) = self.acquired().take() else {
            return Err(self.core.not_held());
        };
        if let Err(err) = self.core.manager.relinquish(&path).await {
            let mut acquired = self.acquired();
            if acquired.is_none() {
                *acquired = Some(path);
            }
            return Err(err);
        }
        self.released.notify_waiters();
        Ok(())
    }

    async fn destroy(&self) -> CoordResult<()> {
        let held = self.acquired().take();
        self.released.notify_waiters();
        self.core.manager.cache().remove_lock(
            &self.core.entity_path,
            self.core.reservation_type,
            self.core.id,
        );
        if let Some(path) = held {
            self.core.manager.relinquish(&path).await?;
        }
        debug!(entity_path = %self.core.entity_path, "lock destroyed");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HoldState {
    acquired: Option<String>,
    holds: u32,
}

/// Reentrant distributed lock; `holds > 0` exactly when a reservation is held.
pub struct ReentrantLock {
    core: LockCore,
    state: Mutex<HoldState>,
    gate: tokio::sync::Mutex<()>,
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("id", &self.core.id)
            .field("entity_path", &self.core.entity_path)
            .field("reservation_type", &self.core.reservation_type)
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl ReentrantLock {
    pub(crate) fn new(
        manager: Arc<ReservationManager>,
        owner_id: impl Into<String>,
        entity_path: impl Into<String>,
        reservation_type: ReservationType,
        acl: Vec<Acl>,
    ) -> Self {
        Self {
            core: LockCore::new(
                manager,
                owner_id.into(),
                entity_path.into(),
                reservation_type,
                acl,
            ),
            state: Mutex::new(HoldState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HoldState> {
        self.state.lock().expect("lock state poisoned")
    }

    pub fn hold_count(&self) -> u32 {
        self.state().holds
    }

    fn reenter(&self) -> bool {
        let mut state = self.state();
        if state.acquired.is_some() {
            state.holds += 1;
            true
        } else {
            false
        }
    }

    async fn acquire_local(
        &self,
        wait: Option<Duration>,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<bool> {
        if self.reenter() {
            return Ok(true);
        }
        let deadline = deadline_after(wait);
        let Some(_gate) = enter_gate(&self.gate, deadline, interrupt, &self.core.entity_path).await?
        else {
            return Ok(false);
        };
        // another task of this handle may have acquired while we waited
        if self.reenter() {
            return Ok(true);
        }
        let Some(path) = self.core.acquire(deadline, interrupt).await? else {
            return Ok(false);
        };
        let mut state = self.state();
        state.acquired = Some(path);
        state.holds = 1;
        Ok(true)
    }
}

#[async_trait]
impl DistributedLock for ReentrantLock {
    fn handle_id(&self) -> HandleId {
        self.core.id
    }

    fn entity_path(&self) -> &str {
        &self.core.entity_path
    }

    fn reservation_type(&self) -> ReservationType {
        self.core.reservation_type
    }

    fn lock_id(&self) -> Option<String> {
        self.state().acquired.clone()
    }

    fn is_revoked(&self) -> bool {
        self.state().acquired.is_none()
    }

    fn revoke(&self, reservation_id: &str) -> bool {
        let mut state = self.state();
        if state.acquired.as_deref() != Some(reservation_id) {
            return false;
        }
        state.acquired = None;
        state.holds = 0;
        info!(reservation_path = reservation_id, "reentrant lock revoked");
        true
    }

    async fn lock(&self) -> CoordResult<()> {
        if self.acquire_local(None, None).await? {
            Ok(())
        } else {
            Err(self.core.not_acquired())
        }
    }

    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> CoordResult<()> {
        if self.acquire_local(None, Some(interrupt)).await? {
            Ok(())
        } else {
            Err(self.core.not_acquired())
        }
    }

    async fn try_lock(&self) -> CoordResult<bool> {
        self.acquire_local(Some(Duration::ZERO), None).await
    }

    async fn try_lock_for(
        &self,
        wait: Duration,
        interrupt: Option<&CancellationToken>,
    ) -> CoordResult<bool> {
        self.acquire_local(Some(wait), interrupt).await
    }

    async fn unlock(&self) -> CoordResult<()> {
        let path = {
            let mut state = self.state();
            match state.holds {
                0 => return Err(self.core.not_held()),
                1 => {
                    state.holds = 0;
                    state.acquired.take()
                }
                _ => {
                    state.holds -= 1;
                    return Ok(());
                }
            }
        };
        let Some(path) = path else {
            return Err(self.core.not_held());
        };
        if let Err(err) = self.core.manager.relinquish(&path).await {
            let mut state = self.state();
            if state.acquired.is_none() {
                state.acquired = Some(path);
                state.holds = 1;
            } else {
                warn!(
                    reservation_path = %path,
                    "lock re-acquired while release failed, not restoring hold"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn destroy(&self) -> CoordResult<()> {
        let held = {
            let mut state = self.state();
            state.holds = 0;
            state.acquired.take()
        };
        self.core.manager.cache().remove_lock(
            &self.core.entity_path,
            self.core.reservation_type,
            self.core.id,
        );
        if let Some(path) = held {
            self.core.manager.relinquish(&path).await?;
        }
        debug!(entity_path = %self.core.entity_path, "reentrant lock destroyed");
        Ok(())
    }
}

/// Shared (read) and exclusive (write) reentrant locks on one entity.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
    read: Arc<ReentrantLock>,
    write: Arc<ReentrantLock>,
}

impl ReadWriteLock {
    pub(crate) fn new(read: Arc<ReentrantLock>, write: Arc<ReentrantLock>) -> Self {
        Self { read, write }
    }

    pub fn read_lock(&self) -> &Arc<ReentrantLock> {
        &self.read
    }

    pub fn write_lock(&self) -> &Arc<ReentrantLock> {
        &self.write
    }

    /// Destroys both locks; the first error is returned after both ran.
    pub async fn destroy(&self) -> CoordResult<()> {
        let read = self.read.destroy().await;
        let write = self.write.destroy().await;
        read.and(write)
    }
}
