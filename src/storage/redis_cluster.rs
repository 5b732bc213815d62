//! Redis window store for distributed admission.
//!
//! Uses connection pooling for high performance. Each admission is a
//! MULTI/EXEC pipeline, so every step is applied as one unit on the server.

use std::time::Duration;

use deadpool_redis::redis::{self, AsyncCommands, cmd};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::storage::{WindowAdmission, WindowStore};

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis [`WindowStore`].
///
/// # Example
///
/// ```ignore
/// use skp_throttle::storage::{RedisStoreConfig, RedisWindowStore};
///
/// let store = RedisWindowStore::new(
///     RedisStoreConfig::new("redis://localhost:6379").with_pool_size(20),
/// )
/// .await?;
/// ```
pub struct RedisWindowStore {
    pool: Pool,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl RedisWindowStore {
    /// Connect and verify the server answers PING.
    pub async fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let mut cfg = Config::from_url(&config.url);
        cfg.pool = Some(PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let mut conn = tokio::time::timeout(config.connection_timeout, pool.get())
            .await
            .map_err(|_| StoreError::ConnectionFailed("timed out connecting to redis".into()))?
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Connect using a URL and default pool settings.
    pub async fn from_url(url: impl Into<String>) -> StoreResult<Self> {
        Self::new(RedisStoreConfig::new(url)).await
    }

    /// Build from an existing pool without probing it.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|_| StoreError::PoolExhausted)
    }
}

fn command_failed(err: redis::RedisError) -> StoreError {
    let retryable = err.is_timeout() || err.is_connection_dropped() || err.is_io_error();
    StoreError::operation_failed(err.to_string(), retryable)
}

impl WindowStore for RedisWindowStore {
    async fn admit(&self, admission: WindowAdmission<'_>) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;

        let items: Vec<(u64, &str)> = admission
            .members
            .iter()
            .map(|member| (admission.score, member.as_str()))
            .collect();
        let ttl_ms = i64::try_from(admission.ttl.as_millis()).unwrap_or(i64::MAX).max(1);

        let (before,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(admission.key, "-inf", format!("({}", admission.min_score))
            .ignore()
            .zcard(admission.key)
            .zadd_multiple(admission.key, items.as_slice())
            .ignore()
            .pexpire(admission.key, ttl_ms)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        Ok(before)
    }

    async fn remove(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn().await?;
        conn.zrem::<_, _, ()>(key, members)
            .await
            .map_err(command_failed)
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;
        conn.zcard(key).await.map_err(command_failed)
    }
}
