//! The coordination-store abstraction.
//!
//! This module defines **[`CoordinationStore`]** - the seam between the
//! engine and whatever hierarchical key-value service coordinates a job
//! (ZooKeeper-style trees, etcd, or the in-process
//! [`InMemoryCoordinationStore`](crate::InMemoryCoordinationStore)).
//!
//! The store exposes a tree of absolute slash-separated paths. Nodes carry a
//! small byte payload, may be ephemeral (bound to the creating session), and
//! subtrees can be watched for changes. Barrier markers, group membership,
//! leader-election entries, and aggregator contributions all live in this
//! tree; it is the only cross-worker shared mutable state in the system.
//!
//! # Semantics required of implementations
//!
//! - `create` fails with `NodeExists` on collision and `NoParent` when the
//!   parent is missing; `EphemeralSequential` appends a monotonically
//!   increasing, zero-padded counter scoped to the parent and returns the
//!   final path.
//! - Ephemeral nodes disappear when their creating session ends, and their
//!   removal is observable through subscriptions.
//! - `delete` refuses non-empty nodes (`NotEmpty`) and missing nodes
//!   (`NoNode`); callers wanting idempotence use the client wrapper.
//! - `children_of` returns direct child *names* (not full paths) in sorted
//!   order.
//! - `subscribe` delivers an event for every create, delete, and data change
//!   at or below the given path, in an order consistent with the actual
//!   sequence of mutations. A receiver that cannot keep up is handed
//!   [`TreeEvent::Overflowed`] instead of silently losing events.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// How a node is bound to the session that creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a per-parent sequence counter appended to the name.
    EphemeralSequential,
}

/// A change observed under a subscribed subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// A node appeared at `path`.
    Created { path: String },
    /// The node at `path` was removed.
    Deleted { path: String },
    /// The payload of the node at `path` changed.
    DataChanged { path: String },
    /// The subscriber lagged and may have missed events; re-read the tree.
    Overflowed,
}

impl TreeEvent {
    /// The path this event is about, if it is about one.
    pub fn path(&self) -> Option<&str> {
        match self {
            TreeEvent::Created { path }
            | TreeEvent::Deleted { path }
            | TreeEvent::DataChanged { path } => Some(path),
            TreeEvent::Overflowed => None,
        }
    }
}

/// Async stream of subtree change events.
pub type EventStream = Pin<Box<dyn Stream<Item = TreeEvent> + Send + Sync + 'static>>;

/// Hierarchical coordination tree with ephemeral nodes and watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node at `path` with the given payload and mode.
    ///
    /// Returns the actual path, which differs from the requested one only
    /// for [`CreateMode::EphemeralSequential`].
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Whether a node exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read the payload of the node at `path`.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace the payload of the node at `path`.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete the (empty) node at `path`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Sorted names of the direct children of `path`.
    async fn children_of(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to changes at or below `path`.
    async fn subscribe(&self, path: &str) -> Result<EventStream>;

    /// End this handle's session, releasing its ephemeral nodes.
    async fn close_session(&self) -> Result<()>;
}

/// Validate an absolute tree path; returns it split into segments.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
        return Err(crate::CoordinationError::BadPath(path.to_string()));
    }
    if path == "/" {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(crate::CoordinationError::BadPath(path.to_string()));
    }
    Ok(segments)
}

/// Parent path of `path`, or `None` for the root.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_path("/a/b").unwrap(), vec!["a", "b"]);
        assert!(split_path("a/b").is_err());
        assert!(split_path("/a/b/").is_err());
        assert!(split_path("/a//b").is_err());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn test_event_path() {
        let ev = TreeEvent::Created { path: "/a".into() };
        assert_eq!(ev.path(), Some("/a"));
        assert_eq!(TreeEvent::Overflowed.path(), None);
    }
}
