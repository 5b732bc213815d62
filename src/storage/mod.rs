//! External store abstraction for the distributed limiter.
//!
//! A [`WindowStore`] keeps one sorted set per key. Members are admission
//! records scored by their unix timestamp in microseconds. The only mutation
//! allowed is [`WindowStore::admit`], which runs prune, count, insert and
//! expire as a single atomic unit; [`WindowStore::remove`] exists for the
//! compensating delete after an over-limit insert.

mod memory;
#[cfg(feature = "redis")]
mod redis_cluster;

pub use memory::MemoryWindowStore;

#[cfg(feature = "redis")]
pub use redis_cluster::{RedisStoreConfig, RedisWindowStore};

use std::future::Future;
use std::time::Duration;

use crate::error::StoreResult;

/// One atomic admission transaction against a key's sorted set.
#[derive(Debug, Clone, Copy)]
pub struct WindowAdmission<'a> {
    /// Fully prefixed store key.
    pub key: &'a str,
    /// Members scored strictly below this are removed first.
    pub min_score: u64,
    /// Score of the inserted members.
    pub score: u64,
    /// Members to insert; each must be unique.
    pub members: &'a [String],
    /// Expiration set on the key after the insert.
    pub ttl: Duration,
}

/// Sorted-set store with an atomic four-step admission transaction.
///
/// # Example
///
/// ```ignore
/// use skp_throttle::storage::{MemoryWindowStore, WindowAdmission, WindowStore};
///
/// async fn example<S: WindowStore>(store: &S) -> skp_throttle::StoreResult<()> {
///     let members = vec!["1700000000000000-3f2a".to_string()];
///     let before = store
///         .admit(WindowAdmission {
///             key: "rl:user:1",
///             min_score: 1_699_999_999_000_000,
///             score: 1_700_000_000_000_000,
///             members: &members,
///             ttl: Duration::from_secs(2),
///         })
///         .await?;
///     if before >= 1 {
///         store.remove("rl:user:1", &members).await?;
///     }
///     Ok(())
/// }
/// ```
pub trait WindowStore: Send + Sync + 'static {
    /// Atomically:
    /// 1. remove members scored below `min_score`,
    /// 2. read the set's cardinality,
    /// 3. add `members` at `score`,
    /// 4. set the key to expire after `ttl`.
    ///
    /// Returns the cardinality read in step 2.
    fn admit(&self, admission: WindowAdmission<'_>) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Remove `members` from the set at `key`. Missing members are ignored.
    fn remove(&self, key: &str, members: &[String]) -> impl Future<Output = StoreResult<()>> + Send;

    /// Number of members currently in the set at `key`.
    fn cardinality(&self, key: &str) -> impl Future<Output = StoreResult<u64>> + Send;
}

impl<S: WindowStore + ?Sized> WindowStore for std::sync::Arc<S> {
    fn admit(&self, admission: WindowAdmission<'_>) -> impl Future<Output = StoreResult<u64>> + Send {
        (**self).admit(admission)
    }

    fn remove(&self, key: &str, members: &[String]) -> impl Future<Output = StoreResult<()>> + Send {
        (**self).remove(key, members)
    }

    fn cardinality(&self, key: &str) -> impl Future<Output = StoreResult<u64>> + Send {
        (**self).cardinality(key)
    }
}

impl<S: WindowStore + ?Sized> WindowStore for Box<S> {
    fn admit(&self, admission: WindowAdmission<'_>) -> impl Future<Output = StoreResult<u64>> + Send {
        (**self).admit(admission)
    }

    fn remove(&self, key: &str, members: &[String]) -> impl Future<Output = StoreResult<()>> + Send {
        (**self).remove(key, members)
    }

    fn cardinality(&self, key: &str) -> impl Future<Output = StoreResult<u64>> + Send {
        (**self).cardinality(key)
    }
}
