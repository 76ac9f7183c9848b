//! Error types for coordination operations.
//!
//! Ordinary contention never surfaces as an error: `try_*` calls report it as
//! `false`. Errors are reserved for interruption, misconfiguration, store
//! contract violations and failed releases.

use coord_store::StoreError;
use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Error)]
pub enum CoordError {
    /// Store failure that could not be absorbed (e.g. a failed relinquish).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An interruptible wait was cancelled.
    #[error("interrupted while waiting on {0}")]
    Interrupted(String),

    /// A reservation node name has no parseable sequence suffix.
    #[error("invalid reservation sequence in {0:?}")]
    InvalidSequence(String),

    /// A reservation node name carries a prefix no reservation type uses.
    #[error("unknown reservation prefix in {0:?}")]
    UnknownReservationPrefix(String),

    /// Invalid configuration or argument.
    #[error("configuration error: {0}")]
    Config(String),

    /// A different permit pool size implementation is already in use for the entity.
    #[error("permit pool size mismatch for {entity_path}: cached {cached}, requested {requested}")]
    PermitPoolMismatch {
        entity_path: String,
        cached: &'static str,
        requested: &'static str,
    },

    /// A barrier party left before the barrier tripped.
    #[error("barrier broken: {0}")]
    BrokenBarrier(String),

    /// `await` on a barrier that already tripped and was not reset.
    #[error("barrier already tripped, reset required: {0}")]
    BarrierTripped(String),

    /// A blocking acquisition gave up without a hold (shutdown or store failure).
    #[error("could not acquire {0}")]
    NotAcquired(String),

    /// Release on a handle that holds nothing (never acquired or revoked).
    #[error("not held: {0}")]
    NotHeld(String),

    /// Serialization or deserialization failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CoordError {
    /// Returns true if an interruptible wait was cancelled.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CoordError::Interrupted(_))
    }

    /// Returns true for setup-time errors that retrying cannot fix.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CoordError::Config(_) | CoordError::PermitPoolMismatch { .. }
        )
    }

    /// Returns true for a barrier that broke or already tripped.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            CoordError::BrokenBarrier(_) | CoordError::BarrierTripped(_)
        )
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Codec(err.to_string())
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let interrupted = CoordError::Interrupted("/a".into());
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_config());

        let mismatch = CoordError::PermitPoolMismatch {
            entity_path: "/a".into(),
            cached: "constant",
            requested: "configured",
        };
        assert!(mismatch.is_config());
        assert!(CoordError::Config("zero".into()).is_config());
        assert!(CoordError::BrokenBarrier("/b".into()).is_barrier());
        assert!(!CoordError::NotHeld("/l".into()).is_barrier());

        let store: CoordError = StoreError::ConnectionLoss.into();
        assert!(matches!(store, CoordError::Store(StoreError::ConnectionLoss)));
    }

    #[test]
    fn test_error_display() {
        let err = CoordError::PermitPoolMismatch {
            entity_path: "/base/coord/c/semaphore/s".into(),
            cached: "constant",
            requested: "configured",
        };
        let msg = format!("{err}");
        assert!(msg.contains("cached constant"));
        assert!(msg.contains("requested configured"));
    }
}
