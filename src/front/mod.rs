//! The `FrontNodeManager` maintains the `endpoint -> FrontHandle`
//! registry: the set of local task executors ("fronts") a gateway can
//! dispatch messages to.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collections::{self, HashMap};
use crate::error::*;
use crate::message::PpcMessage;

/// A capability to asynchronously deliver a message to a local front
/// and observe completion.
///
/// Multiple task bindings may refer to the same endpoint handle (one
/// front serves many tasks); the handle itself is cheap to clone
/// (`Arc`-backed) so the `FrontNodeManager`'s snapshot can be iterated
/// without holding any lock across the dispatch.
#[async_trait]
pub trait FrontDispatcher: Send + Sync {
    /// Delivers `msg` to the front, resolving once the front has
    /// acknowledged (successfully or not) having received it.
    async fn dispatch(&self, msg: PpcMessage) -> Result<()>;
}

pub type FrontHandle = Arc<dyn FrontDispatcher>;

/// Registry of local fronts, guarded by a read-write lock.
///
/// Lookup failure is non-fatal: the caller treats a missing front as
/// "front went away" and produces an error ack.
#[derive(Default)]
pub struct FrontNodeManager {
    fronts: RwLock<HashMap<String, FrontHandle>>,
}

impl FrontNodeManager {
    pub fn new() -> Self {
        FrontNodeManager {
            fronts: RwLock::new(collections::new_map()),
        }
    }

    /// Idempotent: a second registration of the same endpoint is a
    /// no-op, matching the original's "don't replace an already-live
    /// front" behavior (the front re-announces itself periodically,
    /// so churn here would race with in-flight dispatches).
    pub async fn register(&self, endpoint: &str, handle: FrontHandle) {
        let mut fronts = self.fronts.write().await;
        if fronts.contains_key(endpoint) {
            return;
        }
        fronts.insert(endpoint.to_owned(), handle);
        tracing::info!(endpoint, "front registered");
    }

    /// Removes the entry; concurrent in-flight dispatches that
    /// already hold a cloned handle continue to completion, since the
    /// handle is reference-counted independently of the registry.
    pub async fn unregister(&self, endpoint: &str) {
        let mut fronts = self.fronts.write().await;
        if fronts.remove(endpoint).is_some() {
            tracing::info!(endpoint, "front unregistered");
        }
    }

    /// Read-side fast path; returns `None` if the endpoint is unknown.
    pub async fn lookup(&self, endpoint: &str) -> Option<FrontHandle> {
        self.fronts.read().await.get(endpoint).cloned()
    }

    /// Returns a consistent-at-one-instant copy for broadcast
    /// iteration, insulating it from concurrent registration churn.
    pub async fn snapshot(&self) -> Vec<(String, FrontHandle)> {
        self.fronts
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFront {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrontDispatcher for CountingFront {
        async fn dispatch(&self, _msg: PpcMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let mgr = FrontNodeManager::new();
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));

        mgr.register(
            "front1",
            Arc::new(CountingFront {
                calls: calls_a.clone(),
            }),
        )
        .await;
        // second registration under the same endpoint is a no-op
        mgr.register(
            "front1",
            Arc::new(CountingFront {
                calls: calls_b.clone(),
            }),
        )
        .await;

        let handle = mgr.lookup("front1").await.expect("front1 registered");
        handle
            .dispatch(PpcMessage::new(0, 0, 0, "T1", "agencyA", vec![]))
            .await
            .unwrap();

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lookup_after_unregister_returns_none() {
        let mgr = FrontNodeManager::new();
        mgr.register(
            "front1",
            Arc::new(CountingFront {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await;
        mgr.unregister("front1").await;
        assert!(mgr.lookup("front1").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_a_point_in_time_copy() {
        let mgr = FrontNodeManager::new();
        mgr.register(
            "front1",
            Arc::new(CountingFront {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await;
        let snap = mgr.snapshot().await;
        mgr.unregister("front1").await;
        assert_eq!(snap.len(), 1);
        assert!(mgr.lookup("front1").await.is_none());
    }
}
