//! Observer dispatch.
//!
//! Observers are registered per path and carry the last state they were told
//! about. Store notifications only say *that* something happened; the dispatch
//! re-reads the path (re-arming every watch on the way, since watches are
//! one-shot) and diffs the fresh state against each observer's snapshot.
//! Callbacks fire only for real differences: child lists compare as sets,
//! data compares bytewise. A node that was deleted and created again between
//! two reads carries a new creation id and is reported as a delete followed by
//! a create, never as a change of children.
//!
//! Work runs on a bounded pool of tokio tasks fed by a bounded queue, never on
//! the store's delivery task. Every dispatch schedules one delayed re-check of
//! the same path; re-checks are tagged and never schedule further re-checks.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use coord_store::path::parent;
use coord_store::{SessionState, StoreClient, StoreResult, Watch, WatchedEvent, Watcher};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ObserverConfig;
use crate::metrics::CoordMetrics;

pub type ObserverId = u64;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Attempts at reading a path whose existence flips while being read.
const READ_ATTEMPTS: usize = 3;

type ChildrenFn = dyn Fn(&[String], &[String]) + Send + Sync;
type DataFn = dyn Fn(&[u8], &[u8]) + Send + Sync;
type NodeFn = dyn Fn(&[u8], &[String]) + Send + Sync;
type SignalFn = dyn Fn() + Send + Sync;

#[derive(Default)]
struct Callbacks {
    children_changed: Option<Box<ChildrenFn>>,
    data_changed: Option<Box<DataFn>>,
    created: Option<Box<NodeFn>>,
    deleted: Option<Box<NodeFn>>,
    state_reset: Option<Box<SignalFn>>,
    state_unknown: Option<Box<SignalFn>>,
}

/// State of a path as last read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// `None` while the node does not exist.
    pub data: Option<Vec<u8>>,
    pub children: Vec<String>,
    /// Creation id of the node that was read.
    pub czxid: Option<i64>,
}

impl Snapshot {
    fn present(data: Vec<u8>, children: Vec<String>, czxid: i64) -> Self {
        Self {
            data: Some(data),
            children,
            czxid: Some(czxid),
        }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

fn same_children(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    b.iter().all(|name| a.contains(name.as_str()))
}

/// A registered interest in one path. Build with [`Observer::builder`] and
/// set only the callbacks you care about.
///
/// Callbacks run on a dispatch worker while the observer's snapshot is
/// locked; they must not block and must not re-register the same observer.
/// A panicking callback is logged and does not take the worker down.
pub struct Observer {
    id: ObserverId,
    owner_id: Option<String>,
    callbacks: Callbacks,
    snapshot: Mutex<Snapshot>,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl Observer {
    pub fn builder() -> ObserverBuilder {
        ObserverBuilder::default()
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    /// Last state this observer was notified about.
    pub fn snapshot(&self) -> Snapshot {
        self.lock_snapshot().clone()
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invoke(&self, callback: &'static str, f: impl FnOnce()) -> usize {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            warn!(observer_id = self.id, callback, "observer callback panicked");
        }
        1
    }

    fn seed(&self, snapshot: Snapshot) {
        *self.lock_snapshot() = snapshot;
    }

    /// Diffs `fresh` against the snapshot, fires callbacks and stores `fresh`.
    /// Returns the number of callbacks invoked.
    fn apply(&self, fresh: &Snapshot) -> usize {
        let mut snapshot = self.lock_snapshot();
        let mut fired = 0;
        match (&snapshot.data, &fresh.data) {
            (None, Some(data)) => fired += self.fire_created(data, &fresh.children),
            (Some(previous), None) => fired += self.fire_deleted(previous, &snapshot.children),
            (Some(previous), Some(data)) if snapshot.czxid != fresh.czxid => {
                trace!(observer_id = self.id, "node was recreated between reads");
                fired += self.fire_deleted(previous, &snapshot.children);
                fired += self.fire_created(data, &fresh.children);
            }
            (Some(previous), Some(data)) => {
                if !same_children(&fresh.children, &snapshot.children)
                    && let Some(cb) = &self.callbacks.children_changed
                {
                    fired += self.invoke("children_changed", || {
                        cb(&fresh.children, &snapshot.children)
                    });
                }
                if previous != data
                    && let Some(cb) = &self.callbacks.data_changed
                {
                    fired += self.invoke("data_changed", || cb(data, previous));
                }
            }
            (None, None) => {}
        }
        *snapshot = fresh.clone();
        fired
    }

    fn fire_created(&self, data: &[u8], children: &[String]) -> usize {
        match &self.callbacks.created {
            Some(cb) => self.invoke("created", || cb(data, children)),
            None => 0,
        }
    }

    fn fire_deleted(&self, previous: &[u8], children: &[String]) -> usize {
        match &self.callbacks.deleted {
            Some(cb) => self.invoke("deleted", || cb(previous, children)),
            None => 0,
        }
    }

    fn signal(&self, state: SessionState) {
        let _guard = self.lock_snapshot();
        let (name, cb) = match state {
            SessionState::Connected => ("state_reset", &self.callbacks.state_reset),
            SessionState::Disconnected | SessionState::Expired => {
                ("state_unknown", &self.callbacks.state_unknown)
            }
        };
        if let Some(cb) = cb {
            self.invoke(name, || cb());
        }
    }
}

#[derive(Default)]
pub struct ObserverBuilder {
    owner_id: Option<String>,
    callbacks: Callbacks,
}

impl fmt::Debug for ObserverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverBuilder")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl ObserverBuilder {
    /// Associates the observer with an owner for [`ObserverDispatch::remove_all_by_owner`].
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// `(updated, previous)` child names.
    pub fn on_children_changed(
        mut self,
        f: impl Fn(&[String], &[String]) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.children_changed = Some(Box::new(f));
        self
    }

    /// `(updated, previous)` data.
    pub fn on_data_changed(mut self, f: impl Fn(&[u8], &[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.data_changed = Some(Box::new(f));
        self
    }

    /// `(data, children)` of the new node.
    pub fn on_created(mut self, f: impl Fn(&[u8], &[String]) + Send + Sync + 'static) -> Self {
        self.callbacks.created = Some(Box::new(f));
        self
    }

    /// `(previous data, previous children)` of the vanished node.
    pub fn on_deleted(mut self, f: impl Fn(&[u8], &[String]) + Send + Sync + 'static) -> Self {
        self.callbacks.deleted = Some(Box::new(f));
        self
    }

    /// The session came back after a disconnect; watches were re-armed.
    pub fn on_state_reset(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.state_reset = Some(Box::new(f));
        self
    }

    /// The session is disconnected or expired; snapshots may be stale.
    pub fn on_state_unknown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.state_unknown = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<Observer> {
        Arc::new(Observer {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            owner_id: self.owner_id,
            callbacks: self.callbacks,
            snapshot: Mutex::new(Snapshot::default()),
        })
    }
}

#[derive(Debug)]
enum Job {
    Refresh { path: String, recheck: bool },
    Session(SessionState),
}

/// Keeps the worker count right however a worker task ends.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registered with the store as a default watcher; forwards into the queue.
struct DispatchWatcher {
    dispatch: Weak<ObserverDispatch>,
}

impl Watcher for DispatchWatcher {
    fn process(&self, event: &WatchedEvent) {
        let Some(dispatch) = self.dispatch.upgrade() else {
            return;
        };
        if event.is_session_event() {
            dispatch.enqueue(Job::Session(event.state));
            return;
        }
        let Some(path) = event.path.as_deref() else {
            return;
        };
        if dispatch.is_being_observed(path) {
            dispatch.enqueue(Job::Refresh {
                path: path.to_owned(),
                recheck: false,
            });
        } else if let Some(parent) = parent(path)
            && dispatch.is_being_observed(parent)
        {
            // a watched child (e.g. an acquired reservation) vanished
            dispatch.enqueue(Job::Refresh {
                path: parent.to_owned(),
                recheck: false,
            });
        } else {
            trace!(path, event_type = %event.event_type, "event for unobserved path");
        }
    }
}

pub struct ObserverDispatch {
    store: Arc<dyn StoreClient>,
    observers: DashMap<String, Vec<Arc<Observer>>>,
    owners: DashMap<String, Vec<(String, ObserverId)>>,
    rechecks: DashMap<String, Instant>,
    queue: mpsc::Sender<Job>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Arc<AtomicUsize>,
    connection_lost: AtomicBool,
    runtime: Handle,
    config: ObserverConfig,
    metrics: CoordMetrics,
    shutdown: CancellationToken,
}

impl fmt::Debug for ObserverDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverDispatch")
            .field("paths", &self.observers.len())
            .field("workers", &self.workers.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ObserverDispatch {
    /// Starts the worker pool and registers with the store as a default
    /// watcher. Must be called within a tokio runtime.
    pub fn new(
        store: Arc<dyn StoreClient>,
        config: ObserverConfig,
        metrics: CoordMetrics,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let dispatch = Arc::new(Self {
            store,
            observers: DashMap::new(),
            owners: DashMap::new(),
            rechecks: DashMap::new(),
            queue: tx,
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Arc::new(AtomicUsize::new(0)),
            connection_lost: AtomicBool::new(false),
            runtime: Handle::current(),
            config,
            metrics,
            shutdown: CancellationToken::new(),
        });
        for _ in 0..dispatch.config.core_workers {
            dispatch.spawn_worker(false);
        }
        dispatch.store.register(Arc::new(DispatchWatcher {
            dispatch: Arc::downgrade(&dispatch),
        }));
        debug!(
            core_workers = dispatch.config.core_workers,
            max_workers = dispatch.config.max_workers,
            queue_depth = dispatch.config.queue_depth,
            "observer dispatch started"
        );
        dispatch
    }

    fn spawn_worker(self: &Arc<Self>, elastic: bool) {
        self.workers.fetch_add(1, Ordering::SeqCst);
        let slot = WorkerSlot(self.workers.clone());
        let dispatch = Arc::downgrade(self);
        let receiver = self.receiver.clone();
        let shutdown = self.shutdown.clone();
        let idle = elastic.then(|| self.config.idle_timeout());
        self.runtime.spawn(async move {
            let _slot = slot;
            loop {
                let next = async { receiver.lock().await.recv().await };
                let job = match idle {
                    Some(idle) => tokio::select! {
                        _ = shutdown.cancelled() => None,
                        res = tokio::time::timeout(idle, next) => match res {
                            Ok(job) => job,
                            Err(_) => {
                                trace!("retiring idle dispatch worker");
                                None
                            }
                        },
                    },
                    None => tokio::select! {
                        _ = shutdown.cancelled() => None,
                        job = next => job,
                    },
                };
                let Some(job) = job else {
                    break;
                };
                let Some(dispatch) = dispatch.upgrade() else {
                    break;
                };
                dispatch.handle(job).await;
            }
        });
    }

    fn enqueue(self: &Arc<Self>, job: Job) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match self.queue.try_send(job) {
            Ok(()) => {
                let backlog = self.queue.max_capacity() - self.queue.capacity();
                if backlog > 0 && self.workers.load(Ordering::SeqCst) < self.config.max_workers {
                    trace!(backlog, "adding elastic dispatch worker");
                    self.spawn_worker(true);
                }
            }
            Err(TrySendError::Full(job)) => {
                self.metrics.observer_events_dropped.inc();
                warn!(?job, "observer dispatch queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn handle(self: &Arc<Self>, job: Job) {
        match job {
            Job::Refresh { path, recheck } => {
                if recheck {
                    self.metrics.observer_rechecks.inc();
                    self.rechecks.remove(&path);
                }
                let fired = self.refresh(&path).await;
                if recheck && fired > 0 {
                    warn!(path, fired, "re-check found changes missed by notifications");
                }
                if !recheck {
                    self.schedule_recheck(&path);
                }
            }
            Job::Session(state) => self.on_session(state),
        }
    }

    fn on_session(self: &Arc<Self>, state: SessionState) {
        match state {
            SessionState::Disconnected | SessionState::Expired => {
                info!(%state, "session state unknown, signalling observers");
                self.connection_lost.store(true, Ordering::SeqCst);
                self.signal(state);
            }
            SessionState::Connected => {
                if !self.connection_lost.swap(false, Ordering::SeqCst) {
                    return;
                }
                info!("session restored, signalling observers and re-reading paths");
                self.signal(state);
                let paths: Vec<String> = self.observers.iter().map(|e| e.key().clone()).collect();
                for path in paths {
                    self.enqueue(Job::Refresh {
                        path,
                        recheck: false,
                    });
                }
            }
        }
    }

    fn signal(&self, state: SessionState) {
        for entry in self.observers.iter() {
            for observer in entry.value() {
                observer.signal(state);
            }
        }
    }

    /// Re-reads `path` and dispatches differences. Returns the number of
    /// callbacks invoked.
    async fn refresh(&self, path: &str) -> usize {
        let observers = self.observers_of(path);
        if observers.is_empty() {
            return 0;
        }
        let fresh = match self.read_state(path).await {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(path, error = %err, "could not read observed path");
                return 0;
            }
        };
        let mut fired = 0;
        for observer in observers {
            fired += observer.apply(&fresh);
        }
        if fired > 0 {
            self.metrics.observer_dispatches.inc_by(fired as u64);
            debug!(path, fired, "observer callbacks dispatched");
        }
        fired
    }

    /// Reads data and children with fresh watches; an absent node gets an
    /// existence watch instead.
    async fn read_state(&self, path: &str) -> StoreResult<Snapshot> {
        for _ in 0..READ_ATTEMPTS {
            match self.store.get_data(path, Watch::Default).await {
                Ok((data, stat)) => match self.store.get_children(path, Watch::Default).await {
                    Ok(children) => return Ok(Snapshot::present(data, children, stat.czxid)),
                    Err(err) if err.is_no_node() => {}
                    Err(err) => return Err(err),
                },
                Err(err) if err.is_no_node() => {}
                Err(err) => return Err(err),
            }
            if self.store.exists(path, Watch::Default).await?.is_none() {
                return Ok(Snapshot::default());
            }
        }
        Ok(Snapshot::default())
    }

    fn schedule_recheck(self: &Arc<Self>, path: &str) {
        let interval = self.config.recheck_interval();
        let now = Instant::now();
        match self.rechecks.entry(path.to_owned()) {
            Entry::Occupied(entry) if entry.get().saturating_duration_since(now) > interval / 2 => {
                trace!(path, "re-check already scheduled");
                return;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(now + interval);
            }
            Entry::Vacant(entry) => {
                entry.insert(now + interval);
            }
        }
        let dispatch = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let path = path.to_owned();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    if let Some(dispatch) = dispatch.upgrade()
                        && dispatch.is_being_observed(&path)
                    {
                        dispatch.enqueue(Job::Refresh { path, recheck: true });
                    }
                }
            }
        });
    }

    /// Registers `observer` on `path`, seeding its snapshot with the current
    /// state and arming watches.
    pub async fn put(self: &Arc<Self>, path: &str, observer: Arc<Observer>) {
        let seed = match self.read_state(path).await {
            Ok(seed) => seed,
            Err(err) => {
                warn!(path, error = %err, "could not seed observer, relying on re-check");
                Snapshot::default()
            }
        };
        observer.seed(seed);
        let mut entry = self.observers.entry(path.to_owned()).or_default();
        if entry.iter().any(|o| o.id() == observer.id()) {
            trace!(path, observer_id = observer.id(), "observer already registered");
        } else {
            debug!(path, observer_id = observer.id(), "observer registered");
            if let Some(owner) = observer.owner_id() {
                self.owners
                    .entry(owner.to_owned())
                    .or_default()
                    .push((path.to_owned(), observer.id()));
            }
            entry.push(observer);
        }
        drop(entry);
        // covers changes between the seed read and the registration
        self.schedule_recheck(path);
    }

    /// Re-reads `path` into the snapshot of one observer without firing any
    /// callback, so the next dispatch diffs against the current state.
    pub async fn reseed(&self, path: &str, observer_id: ObserverId) {
        let Some(observer) = self
            .observers_of(path)
            .into_iter()
            .find(|o| o.id() == observer_id)
        else {
            return;
        };
        match self.read_state(path).await {
            Ok(fresh) => {
                trace!(path, observer_id, "observer reseeded");
                observer.seed(fresh);
            }
            Err(err) => warn!(path, error = %err, "could not reseed observer"),
        }
    }

    /// Removes one observer. Returns true if it was registered.
    pub fn remove(&self, path: &str, observer_id: ObserverId) -> bool {
        let mut removed = None;
        if let Entry::Occupied(mut entry) = self.observers.entry(path.to_owned()) {
            if let Some(index) = entry.get().iter().position(|o| o.id() == observer_id) {
                removed = Some(entry.get_mut().remove(index));
            }
            if entry.get().is_empty() {
                entry.remove();
                self.rechecks.remove(path);
            }
        }
        let Some(observer) = removed else {
            return false;
        };
        self.forget_owner(&observer, path);
        debug!(path, observer_id, "observer removed");
        true
    }

    /// Removes every observer of `path`.
    pub fn remove_all(&self, path: &str) -> usize {
        self.rechecks.remove(path);
        let Some((_, observers)) = self.observers.remove(path) else {
            return 0;
        };
        for observer in &observers {
            self.forget_owner(observer, path);
        }
        observers.len()
    }

    fn forget_owner(&self, observer: &Observer, path: &str) {
        let Some(owner) = observer.owner_id() else {
            return;
        };
        if let Entry::Occupied(mut entry) = self.owners.entry(owner.to_owned()) {
            entry
                .get_mut()
                .retain(|(p, id)| !(p == path && *id == observer.id()));
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Removes every observer registered with `owner_id`.
    pub fn remove_all_by_owner(&self, owner_id: &str) -> usize {
        let Some((_, registrations)) = self.owners.remove(owner_id) else {
            return 0;
        };
        let removed = registrations
            .iter()
            .filter(|(path, id)| self.remove(path, *id))
            .count();
        info!(owner_id, removed, "observers removed for owner");
        removed
    }

    pub fn is_being_observed(&self, path: &str) -> bool {
        self.observers.contains_key(path)
    }

    pub fn observer_count(&self, path: &str) -> usize {
        self.observers.get(path).map(|o| o.len()).unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    fn observers_of(&self, path: &str) -> Vec<Arc<Observer>> {
        self.observers
            .get(path)
            .map(|o| o.value().clone())
            .unwrap_or_default()
    }

    /// Stops workers and pending re-checks.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("observer dispatch shutting down");
            self.shutdown.cancel();
            self.rechecks.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn recheck_pending(&self, path: &str) -> bool {
        self.rechecks.contains_key(path)
    }

    #[cfg(test)]
    pub(crate) fn owner_registrations(&self) -> usize {
        self.owners.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coord_store::{Acl, CreateMode, MemoryClient, MemoryStore};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn dispatch(client: &MemoryClient, recheck_ms: u64) -> Arc<ObserverDispatch> {
        let config = ObserverConfig {
            recheck_interval_ms: recheck_ms,
            ..ObserverConfig::default()
        };
        ObserverDispatch::new(
            Arc::new(client.clone()),
            config,
            CoordMetrics::unregistered(),
        )
    }

    async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("channel closed")
    }

    async fn quiet<T: fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(extra) = rx.try_recv() {
            panic!("unexpected callback: {extra:?}");
        }
    }

    #[test]
    fn test_same_children_is_order_independent() {
        let a = vec!["x".to_owned(), "y".to_owned()];
        let b = vec!["y".to_owned(), "x".to_owned()];
        let c = vec!["x".to_owned(), "z".to_owned()];
        assert!(same_children(&a, &b));
        assert!(!same_children(&a, &c));
        assert!(!same_children(&a, &a[..1]));
    }

    #[tokio::test]
    async fn test_identical_data_is_suppressed() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/conf", b"v0", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let dispatch = dispatch(&client, 60_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Observer::builder()
            .on_data_changed(move |updated, previous| {
                let _ = tx.send((updated.to_vec(), previous.to_vec()));
            })
            .build();
        dispatch.put("/conf", observer).await;

        client.set_data("/conf", b"v1", None).await.unwrap();
        assert_eq!(recv(&mut rx).await, (b"v1".to_vec(), b"v0".to_vec()));
        client.set_data("/conf", b"v1", None).await.unwrap();
        quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_children_created_and_deleted() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        let dispatch = dispatch(&client, 60_000);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let created = tx.clone();
        let changed = tx.clone();
        let observer = Observer::builder()
            .on_created(move |_, children| {
                let _ = created.send(format!("created:{}", children.len()));
            })
            .on_children_changed(move |updated, previous| {
                let _ = changed.send(format!("children:{}->{}", previous.len(), updated.len()));
            })
            .on_deleted(move |_, previous| {
                let _ = tx.send(format!("deleted:{}", previous.len()));
            })
            .build();
        dispatch.put("/entity", observer.clone()).await;
        assert!(!observer.snapshot().exists());

        client
            .create("/entity", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, "created:0");
        client
            .create("/entity/a", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, "children:0->1");
        client.delete("/entity/a", None).await.unwrap();
        assert_eq!(recv(&mut rx).await, "children:1->0");
        client.delete("/entity", None).await.unwrap();
        assert_eq!(recv(&mut rx).await, "deleted:0");
    }

    #[tokio::test]
    async fn test_expired_holder_reaches_entity_observer() {
        let store = MemoryStore::new();
        let client = store.connect();
        let other = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/lock", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let ticket = other
            .create("/lock/EX_", b"", &acl, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let dispatch = dispatch(&client, 60_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Observer::builder()
            .on_children_changed(move |updated, previous| {
                let _ = tx.send((updated.len(), previous.len()));
            })
            .build();
        dispatch.put("/lock", observer).await;
        client.exists(&ticket, Watch::Default).await.unwrap();

        other.expire();
        assert_eq!(recv(&mut rx).await, (0, 1));
    }

    #[tokio::test]
    async fn test_remove_by_owner() {
        let store = MemoryStore::new();
        let client = store.connect();
        let dispatch = dispatch(&client, 60_000);

        dispatch
            .put("/a", Observer::builder().owner("svc-1").build())
            .await;
        dispatch
            .put("/b", Observer::builder().owner("svc-1").build())
            .await;
        let keep = Observer::builder().owner("svc-2").build();
        dispatch.put("/b", keep.clone()).await;
        assert_eq!(dispatch.observer_count("/b"), 2);

        assert_eq!(dispatch.remove_all_by_owner("svc-1"), 2);
        assert!(!dispatch.is_being_observed("/a"));
        assert_eq!(dispatch.observer_count("/b"), 1);
        assert!(dispatch.remove("/b", keep.id()));
        assert!(!dispatch.remove("/b", keep.id()));
        assert_eq!(dispatch.remove_all_by_owner("nobody"), 0);
    }

    #[tokio::test]
    async fn test_owner_index_follows_removals() {
        let store = MemoryStore::new();
        let client = store.connect();
        let dispatch = dispatch(&client, 60_000);

        for _ in 0..50 {
            let observer = Observer::builder().owner("svc-1").build();
            dispatch.put("/b", observer.clone()).await;
            dispatch.put("/b", observer.clone()).await;
            assert_eq!(dispatch.owner_registrations(), 1);
            assert!(dispatch.remove("/b", observer.id()));
        }
        assert_eq!(dispatch.observer_count("/b"), 0);
        assert_eq!(dispatch.owner_registrations(), 0);

        dispatch
            .put("/c", Observer::builder().owner("svc-1").build())
            .await;
        dispatch
            .put("/c", Observer::builder().owner("svc-2").build())
            .await;
        dispatch.put("/c", Observer::builder().build()).await;
        assert_eq!(dispatch.owner_registrations(), 2);
        assert_eq!(dispatch.remove_all("/c"), 3);
        assert_eq!(dispatch.owner_registrations(), 0);
        assert_eq!(dispatch.remove_all_by_owner("svc-1"), 0);
    }

    #[tokio::test]
    async fn test_recreated_node_is_delete_then_create() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/gen", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        client
            .create("/gen/a", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let dispatch = dispatch(&client, 60_000);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let created = tx.clone();
        let changed = tx.clone();
        let observer = Observer::builder()
            .on_created(move |_, children| {
                let _ = created.send(format!("created:{}", children.join(",")));
            })
            .on_children_changed(move |updated, _| {
                let _ = changed.send(format!("children:{}", updated.join(",")));
            })
            .on_deleted(move |_, previous| {
                let _ = tx.send(format!("deleted:{}", previous.join(",")));
            })
            .build();
        dispatch.put("/gen", observer.clone()).await;

        // no yield point until the node is back, so no read sees it missing
        let other = store.connect();
        other.delete("/gen/a", None).await.unwrap();
        other.delete("/gen", None).await.unwrap();
        other
            .create("/gen", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        other
            .create("/gen/b", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, "deleted:a");
        assert_eq!(recv(&mut rx).await, "created:b");
        quiet(&mut rx).await;
        assert_eq!(observer.snapshot().children, vec!["b".to_owned()]);
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_dispatch_alive() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/p", b"v0", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let dispatch = dispatch(&client, 60_000);

        let faulty = Observer::builder()
            .on_data_changed(|_, _| panic!("callback failure"))
            .build();
        dispatch.put("/p", faulty.clone()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Observer::builder()
            .on_data_changed(move |updated, _| {
                let _ = tx.send(updated.to_vec());
            })
            .build();
        dispatch.put("/p", observer).await;

        client.set_data("/p", b"v1", None).await.unwrap();
        assert_eq!(recv(&mut rx).await, b"v1".to_vec());
        client.set_data("/p", b"v2", None).await.unwrap();
        assert_eq!(recv(&mut rx).await, b"v2".to_vec());

        assert_eq!(faulty.snapshot().data, Some(b"v2".to_vec()));
        assert!(dispatch.worker_count() >= ObserverConfig::default().core_workers);
    }

    #[tokio::test]
    async fn test_recheck_does_not_reschedule_itself() {
        let store = MemoryStore::new();
        let client = store.connect();
        let acl = Acl::open_unsafe();
        client
            .create("/r", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        let metrics = CoordMetrics::unregistered();
        let config = ObserverConfig {
            recheck_interval_ms: 40,
            ..ObserverConfig::default()
        };
        let dispatch = ObserverDispatch::new(Arc::new(client.clone()), config, metrics.clone());
        dispatch.put("/r", Observer::builder().build()).await;
        assert!(dispatch.recheck_pending("/r"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_first = metrics.observer_rechecks.get();
        assert!(after_first >= 1);
        assert!(!dispatch.recheck_pending("/r"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(metrics.observer_rechecks.get(), after_first);
    }

    #[tokio::test]
    async fn test_session_signals() {
        let store = MemoryStore::new();
        let client = store.connect();
        let dispatch = dispatch(&client, 60_000);

        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        let unknown = tx.clone();
        let observer = Observer::builder()
            .on_state_unknown(move || {
                let _ = unknown.send("unknown");
            })
            .on_state_reset(move || {
                let _ = tx.send("reset");
            })
            .build();
        dispatch.put("/s", observer).await;

        client.disconnect();
        assert_eq!(recv(&mut rx).await, "unknown");
        client.reconnect();
        assert_eq!(recv(&mut rx).await, "reset");
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let store = MemoryStore::new();
        let client = store.connect();
        let dispatch = dispatch(&client, 60_000);
        assert_eq!(dispatch.worker_count(), ObserverConfig::default().core_workers);
        dispatch.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatch.worker_count(), 0);
    }
}
