//! The asynchronous runtime driving every suspension point in the
//! gateway: peer sends, front dispatches, holding-queue timers and the
//! reconnect timer all run as tasks submitted to this runtime.
//!
//! A single `Runtime` value owns the tokio runtime handle and is the
//! root from which every other component is constructed; `shutdown()`
//! tears everything down in reverse order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::*;

pub type JoinHandle<T> = tokio::task::JoinHandle<T>;

/// Cooperative cancellation signal shared by every long-running task
/// spawned off a `Runtime`. Checked at the top of each loop iteration
/// so that timers and accept loops tolerate being invoked after the
/// gateway has been asked to stop.
#[derive(Clone, Default)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the tokio multi-threaded runtime used by the gateway process.
///
/// Worker thread count defaults to 75% of hardware concurrency, per
/// the resource limits of the routing core.
pub struct Runtime {
    inner: tokio::runtime::Runtime,
    running: RunningFlag,
}

impl Runtime {
    /// Builds a new runtime with `num_threads` worker threads.
    pub fn new(num_threads: usize) -> Result<Self> {
        let inner = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_threads.max(1))
            .thread_name("ppc-gateway-worker")
            .enable_all()
            .build()
            .wrapped(ErrorKind::Other)?;
        Ok(Runtime {
            inner,
            running: RunningFlag::new(),
        })
    }

    /// Returns the default worker-thread count: 75% of the available
    /// hardware concurrency, rounded down, with a floor of 1.
    pub fn default_thread_count() -> usize {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        ((hw * 3) / 4).max(1)
    }

    /// Returns a clone of the running flag, for components that need
    /// to check liveness from inside a spawned task.
    pub fn running_flag(&self) -> RunningFlag {
        self.running.clone()
    }

    /// Spawns a future onto this runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn(fut)
    }

    /// Blocks the calling thread on a future, using this runtime.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.inner.block_on(fut)
    }

    /// Signals every task tracking this runtime's running flag to
    /// stop, then waits for outstanding work to drain.
    pub fn shutdown(self) {
        self.running.stop();
        self.inner.shutdown_timeout(std::time::Duration::from_secs(5));
    }
}

/// Spawns a future onto the ambient tokio runtime (used by code paths
/// that don't hold a `Runtime` handle directly, mirroring tokio's own
/// free-function `spawn`).
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut)
}

/// Sleeps for `dur`, returning early if `running` is flipped off.
/// Returns `true` if the sleep completed normally, `false` if it was
/// cancelled by the running flag going false.
pub async fn sleep_cancellable(dur: std::time::Duration, running: &RunningFlag) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => running.is_running(),
        _ = async {
            while running.is_running() {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        } => false,
    }
}
