//! The production `CacheStorage` backend: a small round-robin pool of
//! Redis connection managers, built from the `cache.*` configuration
//! keys ([`CacheConfig`]).
//!
//! `redis::aio::ConnectionManager` is itself cheap to clone and
//! auto-reconnecting, so `pool_size` here means "how many independent
//! multiplexed connections to spread load across", not a traditional
//! checkout/return pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::CacheConfig;
use crate::error::*;

pub struct RedisCache {
    managers: Vec<ConnectionManager>,
    next: AtomicUsize,
    op_timeout: Duration,
}

impl RedisCache {
    /// Dials `config.pool_size` connection managers against
    /// `config.host:config.port`, failing if any of them cannot be
    /// established within `config.connection_timeout_ms`.
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(build_url(config)).wrapped(ErrorKind::Cache)?;
        let pool_size = config.pool_size.max(1) as usize;
        let connect_timeout = Duration::from_millis(config.connection_timeout_ms);

        let mut managers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let manager = tokio::time::timeout(connect_timeout, client.get_connection_manager())
                .await
                .simple_msg(ErrorKind::Cache, "timed out connecting to cache")?
                .wrapped(ErrorKind::Cache)?;
            managers.push(manager);
        }

        Ok(RedisCache {
            managers,
            next: AtomicUsize::new(0),
            op_timeout: Duration::from_millis(config.socket_timeout_ms),
        })
    }

    fn pick(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.managers.len();
        self.managers[idx].clone()
    }
}

fn build_url(config: &CacheConfig) -> String {
    match &config.password {
        Some(password) => format!(
            "redis://:{}@{}:{}/{}",
            password, config.host, config.port, config.database
        ),
        None => format!("redis://{}:{}/{}", config.host, config.port, config.database),
    }
}

#[async_trait]
impl super::CacheStorage for RedisCache {
    async fn set_value(&self, key: &str, value: &str, expiration_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.pick();
        let op = async {
            match expiration_seconds {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
                None => conn.set::<_, _, ()>(key, value).await,
            }
        };
        tokio::time::timeout(self.op_timeout, op)
            .await
            .simple_msg(ErrorKind::Cache, "cache set timed out")?
            .wrapped(ErrorKind::Cache)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pick();
        tokio::time::timeout(self.op_timeout, conn.get::<_, Option<String>>(key))
            .await
            .simple_msg(ErrorKind::Cache, "cache get timed out")?
            .wrapped(ErrorKind::Cache)
    }

    async fn delete_key(&self, key: &str) -> Result<u64> {
        let mut conn = self.pick();
        tokio::time::timeout(self.op_timeout, conn.del::<_, u64>(key))
            .await
            .simple_msg(ErrorKind::Cache, "cache delete timed out")?
            .wrapped(ErrorKind::Cache)
    }
}
