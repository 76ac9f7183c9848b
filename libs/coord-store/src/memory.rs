//! In-process coordination store.
//!
//! A single [`MemoryStore`] holds the node tree; every [`MemoryClient`]
//! obtained from [`MemoryStore::connect`] is an independent session with its
//! own ephemeral nodes, default watchers and connectivity state. Watches are
//! one-shot and are delivered in order by one background task, the same way a
//! real store client serializes its event thread.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::path::{self, parent};
use crate::{
    Acl, CreateMode, EventType, SessionId, SessionState, Stat, StoreClient, StoreError,
    StoreResult, Watch, WatchedEvent, Watcher,
};

/// Shared in-memory node tree. Cloning yields another handle to the same tree.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

/// One session against a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    session: SessionId,
}

struct Shared {
    state: Mutex<TreeState>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

struct Delivery {
    watchers: Vec<Arc<dyn Watcher>>,
    event: WatchedEvent,
}

#[derive(Clone)]
enum Target {
    Default,
    Custom(Arc<dyn Watcher>),
}

#[derive(Clone)]
struct Registration {
    session: SessionId,
    target: Target,
}

impl Registration {
    fn same_as(&self, other: &Registration) -> bool {
        self.session == other.session
            && match (&self.target, &other.target) {
                (Target::Default, Target::Default) => true,
                (Target::Custom(a), Target::Custom(b)) => same_watcher(a, b),
                _ => false,
            }
    }
}

fn same_watcher(a: &Arc<dyn Watcher>, b: &Arc<dyn Watcher>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn push_unique(watchers: &mut Vec<Arc<dyn Watcher>>, watcher: &Arc<dyn Watcher>) {
    if !watchers.iter().any(|w| same_watcher(w, watcher)) {
        watchers.push(watcher.clone());
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchKind {
    Data,
    Child,
}

struct Node {
    czxid: i64,
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    ctime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
    #[allow(dead_code)]
    acl: Vec<Acl>,
}

impl Node {
    fn new(czxid: i64, data: &[u8], ephemeral_owner: Option<SessionId>, acl: &[Acl]) -> Self {
        let now = Utc::now();
        Self {
            czxid,
            data: data.to_vec(),
            version: 0,
            cversion: 0,
            ctime: now,
            mtime: now,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
            acl: acl.to_vec(),
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            czxid: self.czxid,
            version: self.version,
            cversion: self.cversion,
            num_children: self.children.len(),
            data_length: self.data.len(),
            ctime: self.ctime,
            mtime: self.mtime,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

struct Session {
    state: SessionState,
    default_watchers: Vec<Arc<dyn Watcher>>,
}

struct TreeState {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, Session>,
    next_session: SessionId,
    next_czxid: i64,
    data_watches: HashMap<String, Vec<Registration>>,
    child_watches: HashMap<String, Vec<Registration>>,
}

impl Default for TreeState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::new(0, &[], None, &Acl::open_unsafe()));
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 1,
            next_czxid: 1,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }
}

impl TreeState {
    fn check(&self, session: SessionId) -> StoreResult<()> {
        match self.sessions.get(&session).map(|s| s.state) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Disconnected) => Err(StoreError::ConnectionLoss),
            Some(SessionState::Expired) | None => Err(StoreError::SessionExpired),
        }
    }

    fn arm(&mut self, kind: WatchKind, path: &str, session: SessionId, watch: Watch) {
        let target = match watch {
            Watch::None => return,
            Watch::Default => Target::Default,
            Watch::Custom(watcher) => Target::Custom(watcher),
        };
        let registration = Registration { session, target };
        let table = match kind {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Child => &mut self.child_watches,
        };
        let entry = table.entry(path.to_owned()).or_default();
        if !entry.iter().any(|r| r.same_as(&registration)) {
            entry.push(registration);
        }
    }

    fn resolve(&self, registrations: &[Registration]) -> Vec<Arc<dyn Watcher>> {
        let mut watchers = Vec::new();
        for registration in registrations {
            match &registration.target {
                Target::Custom(watcher) => push_unique(&mut watchers, watcher),
                Target::Default => {
                    if let Some(session) = self.sessions.get(&registration.session) {
                        for watcher in &session.default_watchers {
                            push_unique(&mut watchers, watcher);
                        }
                    }
                }
            }
        }
        watchers
    }

    /// Fires and consumes the watches a node event triggers.
    fn trigger(&mut self, path: &str, event_type: EventType, out: &mut Vec<Delivery>) {
        let mut fired = Vec::new();
        if matches!(
            event_type,
            EventType::NodeCreated | EventType::NodeDataChanged | EventType::NodeDeleted
        ) {
            fired.extend(self.data_watches.remove(path).unwrap_or_default());
        }
        if matches!(
            event_type,
            EventType::NodeChildrenChanged | EventType::NodeDeleted
        ) {
            fired.extend(self.child_watches.remove(path).unwrap_or_default());
        }
        let watchers = self.resolve(&fired);
        if !watchers.is_empty() {
            trace!(path, %event_type, watchers = watchers.len(), "firing watches");
            out.push(Delivery {
                watchers,
                event: WatchedEvent::node(event_type, path),
            });
        }
    }

    /// Every watcher that should hear about a connectivity transition of `session`.
    fn session_watchers(&self, session: SessionId) -> Vec<Arc<dyn Watcher>> {
        let mut registrations: Vec<Registration> = self
            .data_watches
            .values()
            .chain(self.child_watches.values())
            .flatten()
            .filter(|r| r.session == session)
            .cloned()
            .collect();
        registrations.push(Registration {
            session,
            target: Target::Default,
        });
        self.resolve(&registrations)
    }

    fn drop_watches_of(&mut self, session: SessionId) {
        for table in [&mut self.data_watches, &mut self.child_watches] {
            table.retain(|_, regs| {
                regs.retain(|r| r.session != session);
                !regs.is_empty()
            });
        }
    }

    fn remove_node(&mut self, path: &str, out: &mut Vec<Delivery>) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        if let Some(parent_path) = parent(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent_path) {
                parent_node.children.remove(path::last_token(path));
                parent_node.cversion += 1;
            }
            self.trigger(path, EventType::NodeDeleted, out);
            self.trigger(parent_path, EventType::NodeChildrenChanged, out);
        }
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
        out: &mut Vec<Delivery>,
    ) -> StoreResult<String> {
        path::validate(path)?;
        let parent_path = parent(path).ok_or_else(|| StoreError::NodeExists(path.to_owned()))?;
        let parent_node = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| StoreError::NoNode(parent_path.to_owned()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent_path.to_owned()));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            format!("{path}{seq:010}")
        } else {
            path.to_owned()
        };
        let name = path::last_token(&actual).to_owned();
        if parent_node.children.contains(&name) {
            return Err(StoreError::NodeExists(actual));
        }
        if mode.is_sequential() {
            parent_node.next_sequence += 1;
        }
        parent_node.children.insert(name);
        parent_node.cversion += 1;

        let owner = mode.is_ephemeral().then_some(session);
        let czxid = self.next_czxid;
        self.next_czxid += 1;
        self.nodes
            .insert(actual.clone(), Node::new(czxid, data, owner, acl));
        self.trigger(&actual, EventType::NodeCreated, out);
        self.trigger(parent_path, EventType::NodeChildrenChanged, out);
        Ok(actual)
    }

    fn delete(
        &mut self,
        path: &str,
        version: Option<i32>,
        out: &mut Vec<Delivery>,
    ) -> StoreResult<()> {
        path::validate(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::BadVersion {
                path: path.to_owned(),
                expected,
                actual: node.version,
            });
        }
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_owned()));
        }
        if path == "/" {
            return Err(StoreError::InvalidPath(path.to_owned()));
        }
        self.remove_node(path, out);
        Ok(())
    }

    fn set_data(
        &mut self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
        out: &mut Vec<Delivery>,
    ) -> StoreResult<Stat> {
        path::validate(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::BadVersion {
                path: path.to_owned(),
                expected,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        node.mtime = Utc::now();
        let stat = node.stat();
        self.trigger(path, EventType::NodeDataChanged, out);
        Ok(stat)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Runs `f` against the tree and queues the deliveries it produced while
    /// still holding the lock, so delivery order matches mutation order.
    fn apply<R>(&self, f: impl FnOnce(&mut TreeState, &mut Vec<Delivery>) -> R) -> R {
        let mut guard = self.lock();
        let mut out = Vec::new();
        let result = f(&mut guard, &mut out);
        for delivery in out {
            // receiver only goes away when the runtime shuts down
            let _ = self.deliveries.send(delivery);
        }
        result
    }
}

impl MemoryStore {
    /// Creates an empty tree containing only `/`.
    ///
    /// Spawns the delivery task, so this must be called within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                for watcher in &delivery.watchers {
                    watcher.process(&delivery.event);
                }
            }
            debug!("memory store delivery task finished");
        });
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeState::default()),
                deliveries: tx,
            }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> MemoryClient {
        let mut guard = self.shared.lock();
        let session = guard.next_session;
        guard.next_session += 1;
        guard.sessions.insert(
            session,
            Session {
                state: SessionState::Connected,
                default_watchers: Vec::new(),
            },
        );
        debug!(session, "memory store session opened");
        MemoryClient {
            shared: self.shared.clone(),
            session,
        }
    }

    /// Number of nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.shared.lock().nodes.len()
    }
}

impl MemoryClient {
    /// Current connectivity of this session.
    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .sessions
            .get(&self.session)
            .map(|s| s.state)
            .unwrap_or(SessionState::Expired)
    }

    /// Simulates a transport disconnect; the session and its watches survive.
    pub fn disconnect(&self) {
        let session = self.session;
        self.shared.apply(|state, out| {
            let Some(s) = state.sessions.get_mut(&session) else {
                return;
            };
            if s.state != SessionState::Connected {
                return;
            }
            s.state = SessionState::Disconnected;
            info!(session, "memory store session disconnected");
            out.push(Delivery {
                watchers: state.session_watchers(session),
                event: WatchedEvent::session(SessionState::Disconnected),
            });
        });
    }

    /// Re-establishes a disconnected session. Returns false if it already expired.
    pub fn reconnect(&self) -> bool {
        let session = self.session;
        self.shared.apply(|state, out| {
            let Some(s) = state.sessions.get_mut(&session) else {
                return false;
            };
            match s.state {
                SessionState::Expired => false,
                SessionState::Connected => true,
                SessionState::Disconnected => {
                    s.state = SessionState::Connected;
                    info!(session, "memory store session reconnected");
                    out.push(Delivery {
                        watchers: state.session_watchers(session),
                        event: WatchedEvent::session(SessionState::Connected),
                    });
                    true
                }
            }
        })
    }

    /// Expires the session: its watches are dropped, its ephemeral nodes are
    /// deleted (notifying other sessions as usual) and its watchers receive
    /// an `Expired` transition.
    pub fn expire(&self) {
        let session = self.session;
        self.shared.apply(|state, out| {
            let Some(s) = state.sessions.get(&session) else {
                return;
            };
            if s.state == SessionState::Expired {
                return;
            }
            let watchers = state.session_watchers(session);
            state.drop_watches_of(session);
            if let Some(s) = state.sessions.get_mut(&session) {
                s.state = SessionState::Expired;
            }

            let owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            info!(session, ephemerals = owned.len(), "memory store session expired");
            for path in owned {
                state.remove_node(&path, out);
            }
            out.push(Delivery {
                watchers,
                event: WatchedEvent::session(SessionState::Expired),
            });
        });
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        let mut guard = self.shared.lock();
        if let Some(session) = guard.sessions.get_mut(&self.session) {
            push_unique(&mut session.default_watchers, &watcher);
        }
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> StoreResult<String> {
        let session = self.session;
        self.shared.apply(|state, out| {
            state.check(session)?;
            state.create(session, path, data, acl, mode, out)
        })
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        let session = self.session;
        self.shared.apply(|state, out| {
            state.check(session)?;
            state.delete(path, version, out)
        })
    }

    async fn exists(&self, path: &str, watch: Watch) -> StoreResult<Option<Stat>> {
        path::validate(path)?;
        let mut guard = self.shared.lock();
        guard.check(self.session)?;
        let stat = guard.nodes.get(path).map(Node::stat);
        guard.arm(WatchKind::Data, path, self.session, watch);
        Ok(stat)
    }

    async fn get_children(&self, path: &str, watch: Watch) -> StoreResult<Vec<String>> {
        path::validate(path)?;
        let mut guard = self.shared.lock();
        guard.check(self.session)?;
        let children = guard
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        guard.arm(WatchKind::Child, path, self.session, watch);
        Ok(children)
    }

    async fn get_data(&self, path: &str, watch: Watch) -> StoreResult<(Vec<u8>, Stat)> {
        path::validate(path)?;
        let mut guard = self.shared.lock();
        guard.check(self.session)?;
        let result = guard
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()))
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        guard.arm(WatchKind::Data, path, self.session, watch);
        Ok(result)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        let session = self.session;
        self.shared.apply(|state, out| {
            state.check(session)?;
            state.set_data(path, data, version, out)
        })
    }

    async fn sync(&self, path: &str) -> StoreResult<()> {
        path::validate(path)?;
        self.shared.lock().check(self.session)
    }
}
