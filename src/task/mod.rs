//! The `TaskManager` maps a `taskID` to the local-front endpoint
//! responsible for it, with a fixed 24h TTL. The two-tier
//! (`cluster mode`) variant additionally mirrors bindings into a
//! shared cache, so a task started on one gateway process remains
//! routable from a sibling process during failover.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};

use crate::cache::CacheStorage;
use crate::collections::{self, HashMap};
use crate::error::*;

/// Fixed TTL for a task binding: 24 hours, per the routing core's data
/// model. Not configurable — only the holding-queue timeout is.
pub const TASK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Binding {
    endpoint: String,
    // fires to cancel the TTL timer on an explicit `remove`
    cancel_ttl: Option<oneshot::Sender<()>>,
}

/// In-memory `taskID -> endpoint` routing table.
///
/// At any instant each `taskID` maps to at most one endpoint;
/// re-registering the same `taskID` is an `AlreadyExists` error.
#[derive(Default)]
pub struct TaskManager {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl TaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(TaskManager {
            bindings: RwLock::new(collections::new_map()),
        })
    }

    /// Registers `task_id` as bound to `endpoint`, arming a 24h TTL
    /// timer. Fails with `AlreadyExists` if a binding is already
    /// present. The emptiness check and the insert happen under the
    /// same write-lock acquisition, so two concurrent callers racing
    /// on the same `task_id` cannot both succeed.
    pub async fn register(self: &Arc<Self>, task_id: &str, endpoint: &str) -> Result<()> {
        let cancel_tx = self.spawn_ttl_timer(task_id.to_owned());
        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(task_id) {
            // timer we just armed would otherwise outlive this binding
            let _ = cancel_tx.send(());
            return Err("task id already exists").simple(ErrorKind::AlreadyExists);
        }
        bindings.insert(
            task_id.to_owned(),
            Binding {
                endpoint: endpoint.to_owned(),
                cancel_ttl: Some(cancel_tx),
            },
        );
        drop(bindings);
        tracing::info!(task_id, endpoint, "task registered");
        Ok(())
    }

    /// Arms a 24h TTL timer for `task_id`, returning the handle that
    /// cancels it. Does not touch `bindings` itself.
    fn spawn_ttl_timer(self: &Arc<Self>, task_id: String) -> oneshot::Sender<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(TASK_TTL) => {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.remove(&task_id).await;
                    }
                }
                _ = cancel_rx => {}
            }
        });
        cancel_tx
    }

    /// Used by the cache-backed variant's cache-hit repopulation path;
    /// does not check for an existing entry, since the caller has
    /// already decided to (re)insert.
    async fn insert_binding(self: &Arc<Self>, task_id: &str, endpoint: &str) {
        let cancel_tx = self.spawn_ttl_timer(task_id.to_owned());
        let mut bindings = self.bindings.write().await;
        bindings.insert(
            task_id.to_owned(),
            Binding {
                endpoint: endpoint.to_owned(),
                cancel_ttl: Some(cancel_tx),
            },
        );
        drop(bindings);
        tracing::info!(task_id, endpoint, "task registered");
    }

    /// Returns the endpoint bound to `task_id`, if any.
    pub async fn lookup(&self, task_id: &str) -> Option<String> {
        self.bindings
            .read()
            .await
            .get(task_id)
            .map(|b| b.endpoint.clone())
    }

    /// Removes any binding for `task_id` and cancels its TTL timer.
    pub async fn remove(&self, task_id: &str) {
        let mut bindings = self.bindings.write().await;
        if let Some(mut binding) = bindings.remove(task_id) {
            if let Some(cancel) = binding.cancel_ttl.take() {
                let _ = cancel.send(());
            }
            tracing::info!(task_id, "task removed");
        }
    }
}

/// Two-tier variant, also mirroring bindings into a shared cache.
///
/// Write-through policy: `register` writes the local map first, then
/// best-effort writes the cache (a cache write failure is logged, not
/// propagated — the local map is authoritative locally). `lookup`
/// consults the local map; on miss, consults the cache, and on a cache
/// hit repopulates the local map with a fresh TTL. `remove` removes the
/// local entry unconditionally, then deletes from the cache.
pub struct CachedTaskManager {
    local: Arc<TaskManager>,
    cache: Arc<dyn CacheStorage>,
}

impl CachedTaskManager {
    pub fn new(cache: Arc<dyn CacheStorage>) -> Arc<Self> {
        Arc::new(CachedTaskManager {
            local: TaskManager::new(),
            cache,
        })
    }

    pub async fn register(self: &Arc<Self>, task_id: &str, endpoint: &str) -> Result<()> {
        self.local.register(task_id, endpoint).await?;
        if let Err(e) = self
            .cache
            .set_value(task_id, endpoint, Some(TASK_TTL.as_secs()))
            .await
        {
            tracing::warn!(task_id, error = %e, "cache write failed during task registration");
        }
        Ok(())
    }

    pub async fn lookup(self: &Arc<Self>, task_id: &str) -> Option<String> {
        if let Some(endpoint) = self.local.lookup(task_id).await {
            return Some(endpoint);
        }
        match self.cache.get_value(task_id).await {
            Ok(Some(endpoint)) => {
                // different node should not share the cache with the
                // same database; repopulate our local map with a
                // fresh TTL so the hot path serves subsequent lookups
                self.local.insert_binding(task_id, &endpoint).await;
                Some(endpoint)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(task_id, error = %e, "cache lookup failed");
                None
            }
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.local.remove(task_id).await;
        if let Err(e) = self.cache.delete_key(task_id).await {
            tracing::warn!(task_id, error = %e, "cache delete failed during task removal");
        }
    }
}

/// Common interface the `Gateway` routes through, implemented by both
/// the plain and cache-backed task managers.
#[async_trait::async_trait]
pub trait TaskRouting: Send + Sync {
    async fn register(&self, task_id: &str, endpoint: &str) -> Result<()>;
    async fn lookup(&self, task_id: &str) -> Option<String>;
    async fn remove(&self, task_id: &str);
}

#[async_trait::async_trait]
impl TaskRouting for Arc<TaskManager> {
    async fn register(&self, task_id: &str, endpoint: &str) -> Result<()> {
        TaskManager::register(self, task_id, endpoint).await
    }
    async fn lookup(&self, task_id: &str) -> Option<String> {
        TaskManager::lookup(self, task_id).await
    }
    async fn remove(&self, task_id: &str) {
        TaskManager::remove(self, task_id).await
    }
}

#[async_trait::async_trait]
impl TaskRouting for Arc<CachedTaskManager> {
    async fn register(&self, task_id: &str, endpoint: &str) -> Result<()> {
        CachedTaskManager::register(self, task_id, endpoint).await
    }
    async fn lookup(&self, task_id: &str) -> Option<String> {
        CachedTaskManager::lookup(self, task_id).await
    }
    async fn remove(&self, task_id: &str) {
        CachedTaskManager::remove(self, task_id).await
    }
}
