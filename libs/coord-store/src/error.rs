//! Error taxonomy for store operations.
//!
//! The variants mirror the failure classes a ZooKeeper-like store reports, so
//! callers can tell "node absent" and "connection trouble" apart from real
//! contract violations.

use thiserror::Error;

/// Errors returned by [`StoreClient`](crate::StoreClient) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The addressed node (or, for `create`, its parent) does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// A node already exists at the requested path.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// An optimistic version check failed.
    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Attempted to delete a node that still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The client is currently disconnected from the store.
    #[error("connection loss")]
    ConnectionLoss,

    /// The session backing this client has expired.
    #[error("session expired")]
    SessionExpired,

    /// The path is malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    /// Returns true when the addressed node is absent.
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }

    /// Returns true for connectivity failures that may clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }

    /// Returns true once the session is gone for good.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, StoreError::SessionExpired)
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let no_node = StoreError::NoNode("/a".into());
        assert!(no_node.is_no_node());
        assert!(!no_node.is_transient());

        assert!(StoreError::ConnectionLoss.is_transient());
        assert!(!StoreError::ConnectionLoss.is_session_expired());
        assert!(StoreError::SessionExpired.is_session_expired());
        assert!(!StoreError::SessionExpired.is_transient());
        assert!(!StoreError::NotEmpty("/a".into()).is_no_node());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::BadVersion {
            path: "/a/b".into(),
            expected: 1,
            actual: 4,
        };
        let msg = format!("{err}");
        assert!(msg.contains("/a/b"));
        assert!(msg.contains("expected 1"));
        assert!(msg.contains("found 4"));
    }
}
