use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Identifier of a client session with the store.
pub type SessionId = u64;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Node metadata returned by `exists`, `get_data` and `set_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Creation id, unique per node creation: a deleted and recreated node
    /// gets a new one.
    pub czxid: i64,
    /// Data version, bumped on every `set_data`.
    pub version: i32,
    /// Child version, bumped on every child create/delete.
    pub cversion: i32,
    pub num_children: usize,
    pub data_length: usize,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
}

/// Permission bits carried by an [`Acl`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Perms(u32);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const CREATE: Perms = Perms(1 << 2);
    pub const DELETE: Perms = Perms(1 << 3);
    pub const ADMIN: Perms = Perms(1 << 4);
    pub const ALL: Perms = Perms(0b1_1111);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Self) -> Self::Output {
        Perms(self.0 | rhs.0)
    }
}

/// Access control entry attached to a node at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Acl {
    pub perms: Perms,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub fn new(perms: Perms, scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            perms,
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// `world:anyone` with every permission.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::ALL, "world", "anyone")]
    }

    /// `world:anyone` read only.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::READ, "world", "anyone")]
    }
}

/// Kind of structural change carried by a [`WatchedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Connectivity transition only; no path involved.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::None => write!(f, "none"),
            EventType::NodeCreated => write!(f, "node_created"),
            EventType::NodeDeleted => write!(f, "node_deleted"),
            EventType::NodeDataChanged => write!(f, "node_data_changed"),
            EventType::NodeChildrenChanged => write!(f, "node_children_changed"),
        }
    }
}

/// Session connectivity as observed by the client when an event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

/// A fired watch or a connectivity transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: SessionState,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: SessionState::Connected,
            path: Some(path.into()),
        }
    }

    pub fn session(state: SessionState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    pub fn is_session_event(&self) -> bool {
        self.event_type == EventType::None
    }
}

/// Receiver of watch notifications.
///
/// Invoked on the store's single delivery task; implementations must return
/// quickly and never block.
pub trait Watcher: Send + Sync {
    fn process(&self, event: &WatchedEvent);
}

/// Watch argument for read operations.
#[derive(Clone, Default)]
pub enum Watch {
    /// Do not arm a watch.
    #[default]
    None,
    /// Arm a watch routed to the session's registered default watchers.
    Default,
    /// Arm a watch routed to the given watcher only.
    Custom(Arc<dyn Watcher>),
}

impl Watch {
    pub fn is_armed(&self) -> bool {
        !matches!(self, Watch::None)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watch::None => write!(f, "Watch::None"),
            Watch::Default => write!(f, "Watch::Default"),
            Watch::Custom(_) => write!(f, "Watch::Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::PersistentSequential.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
    }

    #[test]
    fn test_perms() {
        let rw = Perms::READ | Perms::WRITE;
        assert!(rw.contains(Perms::READ));
        assert!(!rw.contains(Perms::DELETE));
        assert!(Perms::ALL.contains(rw | Perms::ADMIN));
        assert_eq!(Acl::open_unsafe()[0].perms, Perms::ALL);
    }

    #[test]
    fn test_session_event() {
        let ev = WatchedEvent::session(SessionState::Expired);
        assert!(ev.is_session_event());
        assert!(ev.path.is_none());
        let ev = WatchedEvent::node(EventType::NodeDeleted, "/a");
        assert!(!ev.is_session_event());
        assert_eq!(ev.to_owned().path.as_deref(), Some("/a"));
    }
}
