//! Retrying client over a [`CoordinationStore`].
//!
//! The client owns the policy side of tree access: transient errors are
//! retried with bounded exponential backoff (base 1 s, 3 attempts by
//! default, jittered), idempotent creates swallow `NodeExists`, idempotent
//! deletes swallow `NoNode`, and teardown is a recursive delete. Everything
//! else - session expiry in particular - propagates unchanged.

use crate::error::{CoordinationError, Result};
use crate::traits::{parent_of, CoordinationStore, CreateMode, EventStream};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Policy-carrying handle to the coordination tree.
#[derive(Clone)]
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl CoordinationClient {
    /// Wrap a store with the default retry policy.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF,
        }
    }

    /// Override the retry budget and backoff base.
    pub fn with_retry_policy(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Create a node, propagating `NodeExists`.
    pub async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.retrying("create", || self.store.create(path, data.clone(), mode))
            .await
    }

    /// Create a node if absent; `NodeExists` is success.
    pub async fn ensure(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        match self.create(path, data, mode).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_node_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create every missing ancestor of `path` (inclusive) as a persistent,
    /// empty node.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut cursor = path;
        while cursor != "/" {
            ancestors.push(cursor.to_string());
            cursor = parent_of(cursor)
                .ok_or_else(|| CoordinationError::BadPath(path.to_string()))?;
        }
        for node in ancestors.into_iter().rev() {
            self.ensure(&node, Vec::new(), CreateMode::Persistent).await?;
        }
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.retrying("exists", || self.store.exists(path)).await
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.retrying("get_data", || self.store.get_data(path)).await
    }

    pub async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.retrying("set_data", || self.store.set_data(path, data.clone()))
            .await
    }

    /// Delete a node, propagating `NoNode`.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.retrying("delete", || self.store.delete(path)).await
    }

    /// Delete a node if present; `NoNode` is success.
    pub async fn delete_quiet(&self, path: &str) -> Result<()> {
        match self.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete `path` and everything below it. Nodes that vanish while the
    /// walk runs are treated as already deleted; a node that gains children
    /// mid-walk is re-walked a bounded number of times.
    pub async fn delete_recursive(&self, path: &str) -> Result<()> {
        const MAX_WALKS: usize = 5;
        for _ in 0..MAX_WALKS {
            let children = match self.children_of(path).await {
                Ok(children) => children,
                Err(e) if e.is_no_node() => return Ok(()),
                Err(e) => return Err(e),
            };
            for child in children {
                let child_path = if path == "/" {
                    format!("/{}", child)
                } else {
                    format!("{}/{}", path, child)
                };
                // recursion through a boxed future, the tree depth is small
                Box::pin(self.delete_recursive(&child_path)).await?;
            }
            if path == "/" {
                return Ok(());
            }
            match self.delete(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_no_node() => return Ok(()),
                Err(CoordinationError::NotEmpty(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoordinationError::NotEmpty(path.to_string()))
    }

    /// Sorted child names, propagating `NoNode`.
    pub async fn children_of(&self, path: &str) -> Result<Vec<String>> {
        self.retrying("children_of", || self.store.children_of(path))
            .await
    }

    /// Sorted child names, with a missing node reading as no children.
    pub async fn children_or_empty(&self, path: &str) -> Result<Vec<String>> {
        match self.children_of(path).await {
            Ok(children) => Ok(children),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to changes at or below `path`.
    pub async fn subscribe(&self, path: &str) -> Result<EventStream> {
        self.retrying("subscribe", || self.store.subscribe(path))
            .await
    }

    /// End the underlying session.
    pub async fn close(&self) -> Result<()> {
        self.store.close_session().await
    }

    async fn retrying<T, Fut, F>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient coordination error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with up to 25% random jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.backoff_base.as_secs_f64();
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let jitter_factor = rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(exp * (1.0 + jitter_factor))
    }
}
