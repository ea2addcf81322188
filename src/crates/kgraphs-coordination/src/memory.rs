//! In-memory coordination tree for development and testing.
//!
//! This module provides **[`InMemoryCoordinationStore`]** - the reference
//! implementation of the [`CoordinationStore`] trait. All workers of an
//! in-process job share one tree through cloned/connected handles; each
//! handle owns a session, and ephemeral nodes vanish when their session
//! ends. Watches are fanned out over a broadcast channel.
//!
//! The store is intended for unit and integration tests and for running a
//! whole job inside one process. It implements the full trait contract,
//! including sequential-ephemeral counters and per-session expiry, so the
//! barrier-protocol and lifecycle tests exercise exactly the code paths a
//! networked backend would.
//!
//! Test helpers beyond the trait:
//!
//! - [`connect`](InMemoryCoordinationStore::connect) - new session over the
//!   same tree (one per simulated worker)
//! - [`expire_session`](InMemoryCoordinationStore::expire_session) - force
//!   a session to die, releasing its ephemerals
//! - [`inject_connection_loss`](InMemoryCoordinationStore::inject_connection_loss) -
//!   make the next N operations fail transiently, for retry tests

use crate::error::{CoordinationError, Result};
use crate::traits::{
    parent_of, split_path, CoordinationStore, CreateMode, EventStream, TreeEvent,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct NodeRecord {
    data: Vec<u8>,
    /// Session id for ephemeral nodes; `None` for persistent ones.
    owner: Option<u64>,
    /// Counter handed to sequential children of this node.
    next_sequence: u64,
}

struct Tree {
    nodes: BTreeMap<String, NodeRecord>,
    sessions: HashMap<u64, Arc<AtomicBool>>,
}

struct Shared {
    tree: RwLock<Tree>,
    events: broadcast::Sender<TreeEvent>,
    next_session: AtomicU64,
    fail_budget: AtomicU32,
}

/// Shared in-process coordination tree. Clone a handle per session via
/// [`connect`](Self::connect).
pub struct InMemoryCoordinationStore {
    shared: Arc<Shared>,
    session: u64,
    expired: Arc<AtomicBool>,
}

impl InMemoryCoordinationStore {
    /// Create a fresh tree and the first session handle over it.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            NodeRecord {
                data: Vec::new(),
                owner: None,
                next_sequence: 0,
            },
        );
        let expired = Arc::new(AtomicBool::new(false));
        let mut sessions = HashMap::new();
        sessions.insert(1, expired.clone());
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(Tree { nodes, sessions }),
                events,
                next_session: AtomicU64::new(2),
                fail_budget: AtomicU32::new(0),
            }),
            session: 1,
            expired,
        }
    }

    /// Open a new session over the same tree.
    pub async fn connect(&self) -> Self {
        let session = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        let expired = Arc::new(AtomicBool::new(false));
        let mut tree = self.shared.tree.write().await;
        tree.sessions.insert(session, expired.clone());
        Self {
            shared: self.shared.clone(),
            session,
            expired,
        }
    }

    /// Force this handle's session to expire, deleting its ephemeral nodes.
    ///
    /// Subsequent operations through this handle fail with
    /// [`CoordinationError::SessionExpired`]; peers observe the ephemerals
    /// disappearing through their subscriptions.
    pub async fn expire_session(&self) {
        self.expired.store(true, Ordering::SeqCst);
        let removed = {
            let mut tree = self.shared.tree.write().await;
            tree.sessions.remove(&self.session);
            let owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, rec)| rec.owner == Some(self.session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                tree.nodes.remove(path);
            }
            owned
        };
        for path in removed {
            let _ = self.shared.events.send(TreeEvent::Deleted { path });
        }
    }

    /// Make the next `count` operations on any handle fail with
    /// [`CoordinationError::ConnectionLoss`].
    pub fn inject_connection_loss(&self, count: u32) {
        self.shared.fail_budget.store(count, Ordering::SeqCst);
    }

    /// Number of nodes currently in the tree (test helper).
    pub async fn node_count(&self) -> usize {
        self.shared.tree.read().await.nodes.len()
    }

    fn check_session(&self) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(CoordinationError::SessionExpired);
        }
        let injected = self
            .shared
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoordinationError::ConnectionLoss(
                "injected connection loss".to_string(),
            ));
        }
        Ok(())
    }

    fn emit(&self, event: TreeEvent) {
        // send only errors when nobody subscribes
        let _ = self.shared.events.send(event);
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_session()?;
        split_path(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists("/".to_string()));
        }
        let parent = parent_of(path)
            .ok_or_else(|| CoordinationError::BadPath(path.to_string()))?
            .to_string();

        let mut tree = self.shared.tree.write().await;
        if !tree.nodes.contains_key(&parent) {
            return Err(CoordinationError::NoParent(path.to_string()));
        }
        let actual = match mode {
            CreateMode::EphemeralSequential => match tree.nodes.get_mut(&parent) {
                Some(parent_rec) => {
                    let seq = parent_rec.next_sequence;
                    parent_rec.next_sequence += 1;
                    format!("{}{:010}", path, seq)
                }
                None => return Err(CoordinationError::NoParent(path.to_string())),
            },
            _ => path.to_string(),
        };
        if tree.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.session),
        };
        tree.nodes.insert(
            actual.clone(),
            NodeRecord {
                data,
                owner,
                next_sequence: 0,
            },
        );
        drop(tree);
        self.emit(TreeEvent::Created {
            path: actual.clone(),
        });
        Ok(actual)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_session()?;
        split_path(path)?;
        Ok(self.shared.tree.read().await.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check_session()?;
        split_path(path)?;
        let tree = self.shared.tree.read().await;
        tree.nodes
            .get(path)
            .map(|rec| rec.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_session()?;
        split_path(path)?;
        {
            let mut tree = self.shared.tree.write().await;
            let rec = tree
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
            rec.data = data;
        }
        self.emit(TreeEvent::DataChanged {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_session()?;
        split_path(path)?;
        if path == "/" {
            return Err(CoordinationError::BadPath("/".to_string()));
        }
        {
            let mut tree = self.shared.tree.write().await;
            if !tree.nodes.contains_key(path) {
                return Err(CoordinationError::NoNode(path.to_string()));
            }
            let prefix = format!("{}/", path);
            if tree.nodes.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)) {
                return Err(CoordinationError::NotEmpty(path.to_string()));
            }
            tree.nodes.remove(path);
        }
        self.emit(TreeEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn children_of(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        split_path(path)?;
        let tree = self.shared.tree.read().await;
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let children = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    async fn subscribe(&self, path: &str) -> Result<EventStream> {
        self.check_session()?;
        split_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let root = path.to_string();
        let stream = BroadcastStream::new(self.shared.events.subscribe()).filter_map(
            move |item| match item {
                Ok(event) => match event.path() {
                    Some(p) if p == root || p.starts_with(&prefix) => Some(event),
                    Some(_) => None,
                    None => Some(event),
                },
                Err(BroadcastStreamRecvError::Lagged(_)) => Some(TreeEvent::Overflowed),
            },
        );
        Ok(Box::pin(stream))
    }

    async fn close_session(&self) -> Result<()> {
        self.expire_session().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_children() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/jobs", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/jobs/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/jobs/b", b"payload".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(store.exists("/jobs/a").await.unwrap());
        assert_eq!(
            store.children_of("/").await.unwrap(),
            vec!["jobs".to_string()]
        );
        assert_eq!(
            store.children_of("/jobs").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(store.get_data("/jobs/b").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = InMemoryCoordinationStore::new();
        let err = store
            .create("/missing/child", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NoParent(_)));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/x", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = store
            .create("/x", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_node_exists());
    }

    #[tokio::test]
    async fn test_sequential_nodes_are_ordered() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/leader", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let first = store
            .create("/leader/n-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = store
            .create("/leader/n-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/leader/n-0000000000");
        assert_eq!(second, "/leader/n-0000000001");
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/a/b", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = store.delete("/a").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotEmpty(_)));
        store.delete("/a/b").await.unwrap();
        store.delete("/a").await.unwrap();
        assert!(!store.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_expiry_releases_ephemerals() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/group", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let worker = store.connect().await;
        worker
            .create("/group/w0", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(store.children_of("/group").await.unwrap().len(), 1);

        worker.expire_session().await;
        assert!(store.children_of("/group").await.unwrap().is_empty());
        assert!(matches!(
            worker.exists("/group").await.unwrap_err(),
            CoordinationError::SessionExpired
        ));
    }

    #[tokio::test]
    async fn test_subscribe_sees_subtree_changes_only() {
        let store = InMemoryCoordinationStore::new();
        store
            .create("/watched", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/other", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let mut events = store.subscribe("/watched").await.unwrap();

        store
            .create("/watched/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/other/b", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store.delete("/watched/a").await.unwrap();

        assert_eq!(
            events.next().await.unwrap(),
            TreeEvent::Created {
                path: "/watched/a".into()
            }
        );
        assert_eq!(
            events.next().await.unwrap(),
            TreeEvent::Deleted {
                path: "/watched/a".into()
            }
        );
    }

    #[tokio::test]
    async fn test_injected_connection_loss() {
        let store = InMemoryCoordinationStore::new();
        store.inject_connection_loss(1);
        let err = store.exists("/").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.exists("/").await.unwrap());
    }
}
