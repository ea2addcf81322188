//! Error types for coordination-tree operations.
//!
//! The variants map onto the failure classes the engine's retry and
//! swallow policies are written against: transient connection trouble is
//! retried, `NodeExists`/`NoNode` on idempotent writes are swallowed by the
//! client, and `SessionExpired` is always fatal to the job.

use thiserror::Error;

/// Convenience result type using [`CoordinationError`]
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors surfaced by coordination stores and the retrying client.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// A create hit a node that already exists.
    ///
    /// Swallowed by [`CoordinationClient::ensure`](crate::CoordinationClient::ensure);
    /// surfaced by raw `create`.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The addressed node does not exist.
    #[error("no such node: {0}")]
    NoNode(String),

    /// A create addressed a node whose parent does not exist.
    #[error("parent node missing for: {0}")]
    NoParent(String),

    /// A delete addressed a node that still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// The path is not absolute or is otherwise malformed.
    #[error("malformed path: {0}")]
    BadPath(String),

    /// Transient loss of connectivity to the coordination service.
    ///
    /// Eligible for bounded-backoff retry.
    #[error("coordination connection loss: {0}")]
    ConnectionLoss(String),

    /// The session backing this handle has expired. Fatal to the job.
    #[error("coordination session expired")]
    SessionExpired,

    /// Backend-specific failure that fits none of the above.
    #[error("coordination backend error: {0}")]
    Backend(String),

    /// Node payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss(_))
    }

    /// Whether this is the already-exists outcome of an idempotent create.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists(_))
    }

    /// Whether this is the missing-node outcome of an idempotent delete/read.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoordinationError::ConnectionLoss("broken pipe".into()).is_transient());
        assert!(!CoordinationError::SessionExpired.is_transient());
        assert!(!CoordinationError::NoNode("/a".into()).is_transient());
    }

    #[test]
    fn test_idempotence_classification() {
        assert!(CoordinationError::NodeExists("/a".into()).is_node_exists());
        assert!(CoordinationError::NoNode("/a".into()).is_no_node());
        assert!(!CoordinationError::NodeExists("/a".into()).is_no_node());
    }
}
