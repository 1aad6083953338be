//! Contract for the shared, distributed key/value cache that backs
//! cluster-mode task routing.
//!
//! [`redis_backend::RedisCache`] (behind the `cache_redis` feature,
//! on by default) is the production implementation. An in-memory
//! stand-in is also provided behind the `cache_in_memory` feature for
//! tests and single-process deployments that still want to exercise
//! the two-tier `TaskManager` code path without standing up an
//! external service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::collections::{self, HashMap};
use crate::error::*;

#[cfg(feature = "cache_redis")]
pub mod redis_backend;

#[cfg(feature = "cache_redis")]
pub use redis_backend::RedisCache;

/// Connection parameters for the shared cache, as recognized from the
/// `cache.*` configuration keys.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u16,
    pub pool_size: u16,
    pub connection_timeout_ms: u64,
    pub socket_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            password: None,
            database: 0,
            pool_size: 8,
            connection_timeout_ms: 500,
            socket_timeout_ms: 500,
        }
    }
}

/// The subset of a Redis-like cache's behavior the gateway depends on.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Sets `key` to `value`. `expiration_seconds` of `None` means the
    /// key never expires.
    async fn set_value(&self, key: &str, value: &str, expiration_seconds: Option<u64>) -> Result<()>;

    /// Returns the value for `key`, or `None` if it doesn't exist.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key`. Returns the number of keys removed (0 or 1).
    async fn delete_key(&self, key: &str) -> Result<u64>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// A single-process, in-memory stand-in for the shared cache.
///
/// This is not a production cache: it does not survive process
/// restarts and does not coordinate with any other gateway. It exists
/// so the write-through `TaskManager` path can be exercised in tests
/// without an external dependency.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache {
            entries: Mutex::new(collections::new_map()),
        }
    }
}

#[async_trait]
impl CacheStorage for InMemoryCache {
    async fn set_value(&self, key: &str, value: &str, expiration_seconds: Option<u64>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: expiration_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at {
                    if Instant::now() >= expires_at {
                        entries.remove(key);
                        return Ok(None);
                    }
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        Ok(if entries.remove(key).is_some() { 1 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = InMemoryCache::new();
        cache.set_value("k", "v", None).await.unwrap();
        assert_eq!(cache.get_value("k").await.unwrap(), Some("v".to_owned()));
    }

    #[tokio::test]
    async fn expired_entries_read_back_as_absent() {
        let cache = InMemoryCache::new();
        cache.set_value("k", "v", Some(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get_value("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = InMemoryCache::new();
        cache.set_value("k", "v", None).await.unwrap();
        assert_eq!(cache.delete_key("k").await.unwrap(), 1);
        assert_eq!(cache.delete_key("k").await.unwrap(), 0);
    }
}
