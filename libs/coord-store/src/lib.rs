//! # coord-store
//!
//! Minimal client contract for a hierarchical, versioned, watch-capable
//! coordination store in the style of ZooKeeper, plus [`memory::MemoryStore`],
//! an in-process implementation with real session semantics.
//!
//! The contract is deliberately narrow: create (optionally ephemeral and/or
//! sequential), delete with an optional version check, existence and data
//! reads, child listing, data writes and `sync`. Every read may arm a one-shot
//! watch which is delivered, together with connectivity transitions, through a
//! single serial delivery path.

use std::sync::Arc;

use async_trait::async_trait;

pub mod error;
pub mod memory;
pub mod path;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryClient, MemoryStore};
pub use path::{create_with_parents, ensure_path};
pub use types::{
    Acl, CreateMode, EventType, Perms, SessionId, SessionState, Stat, Watch, WatchedEvent, Watcher,
};

/// Operations a coordination store client must provide.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Session this client operates under.
    fn session_id(&self) -> SessionId;

    /// Registers a watcher that receives `Watch::Default` notifications and
    /// every connectivity transition of this session.
    fn register(&self, watcher: Arc<dyn Watcher>);

    /// Creates a node and returns its actual path (which differs from `path`
    /// for sequential modes).
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> StoreResult<String>;

    /// Deletes a node. `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()>;

    /// Node metadata, or `None` if absent. A watch is armed either way.
    async fn exists(&self, path: &str, watch: Watch) -> StoreResult<Option<Stat>>;

    /// Child names of a node.
    async fn get_children(&self, path: &str, watch: Watch) -> StoreResult<Vec<String>>;

    /// Data and metadata of a node.
    async fn get_data(&self, path: &str, watch: Watch) -> StoreResult<(Vec<u8>, Stat)>;

    /// Replaces the data of a node. `None` matches any version.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat>;

    /// Flushes the channel between this client and the leader for `path`.
    async fn sync(&self, path: &str) -> StoreResult<()>;
}
