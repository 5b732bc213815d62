//! Admission control primitives for Rust services.
//!
//! `skp_throttle` decides whether a request may proceed now, later, or never:
//!
//! - **Token Bucket**: bursts up to a capacity, refilled at a steady rate, with
//!   blocking waits that never debit on cancellation
//! - **Sliding Log**: exact trailing-window counting, single key or keyed
//! - **Per-Key Registry**: lazily created limiters per key with idle eviction
//! - **Distributed Sliding Log**: one window shared by many processes through
//!   an atomic store transaction (in-memory or Redis)
//! - **Jitter**: full, equal and decorrelated randomization for retry delays
//!
//! Every limiter implements [`Limiter`] or [`KeyedLimiter`], so middleware and
//! the [`throttle`] helper are written once against the capability.
//!
//! # Quick Start
//!
//! ```ignore
//! use skp_throttle::{Limiter, Quota, TokenBucket};
//!
//! #[tokio::main]
//! async fn main() -> skp_throttle::Result<()> {
//!     let bucket = TokenBucket::from_quota(&Quota::per_second(10).with_burst(15))?;
//!
//!     if bucket.allow().await? {
//!         println!("Request allowed! {:.1} tokens left", bucket.available());
//!     }
//!
//!     // Block until a permit is free, or give up after one second.
//!     bucket.wait(tokio::time::sleep(std::time::Duration::from_secs(1))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Limiters
//!
//! | Limiter | Keyed | Best For | Memory |
//! |---------|-------|----------|--------|
//! | [`TokenBucket`] | no | Bursty traffic | Low |
//! | [`WindowLimiter`] | no | Precision critical | O(max) |
//! | [`SlidingWindowLog`] | yes | Precision critical | O(max) per key |
//! | [`PerKeyLimiter`] | yes | Any limiter per client | One limiter per key |
//! | [`DistributedWindowLimiter`] | yes | Multi-instance deployments | In the store |
//!
//! # Feature Flags
//!
//! - `redis`: Redis window store with connection pooling
//! - `full`: everything above

pub mod algorithm;
pub mod clock;
pub mod distributed;
pub mod error;
pub mod jitter;
pub mod keyed;
pub mod quota;
pub mod storage;

// Re-export main types
pub use algorithm::{
    KeyHandle, KeyedLimiter, Limiter, SlidingWindowLog, TokenBucket, WindowLimiter, WindowLog,
    throttle,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use distributed::{DistributedConfig, DistributedWindowLimiter};
pub use error::{AdmissionError, ConfigError, Result, StoreError, StoreResult};
pub use jitter::{JitterCalculator, JitterStrategy, jitter};
pub use keyed::{EvictionConfig, PerKeyLimiter, SweepInterval};
pub use quota::{Quota, QuotaBuilder};

// Re-export storage types
pub use storage::{MemoryWindowStore, WindowAdmission, WindowStore};

#[cfg(feature = "redis")]
pub use storage::{RedisStoreConfig, RedisWindowStore};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::{KeyHandle, KeyedLimiter, Limiter, throttle};
    pub use crate::error::{AdmissionError, Result};
    pub use crate::quota::Quota;

    pub use crate::algorithm::{SlidingWindowLog, TokenBucket, WindowLimiter};
    pub use crate::distributed::{DistributedConfig, DistributedWindowLimiter};
    pub use crate::jitter::{JitterCalculator, JitterStrategy};
    pub use crate::keyed::{EvictionConfig, PerKeyLimiter};
    pub use crate::storage::{MemoryWindowStore, WindowStore};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisWindowStore;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Generic consumer written once against the capability.
    async fn admitted<L: Limiter>(limiter: &L, attempts: usize) -> usize {
        let mut count = 0;
        for _ in 0..attempts {
            if limiter.allow().await.unwrap() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_integration_every_limiter_behind_one_capability() {
        use crate::prelude::*;

        let quota = Quota::per_minute(3);

        let bucket = TokenBucket::from_quota(&quota).unwrap();
        assert_eq!(admitted(&bucket, 5).await, 3);

        let window = WindowLimiter::from_quota(&quota).unwrap();
        assert_eq!(admitted(&window, 5).await, 3);

        let log = Arc::new(SlidingWindowLog::from_quota(&quota).unwrap());
        assert_eq!(admitted(&KeyHandle::new(log, "a"), 5).await, 3);

        let registry = Arc::new(
            PerKeyLimiter::token_buckets(&quota, EvictionConfig::manual(Duration::from_secs(60))).unwrap(),
        );
        assert_eq!(admitted(&KeyHandle::new(registry, "a"), 5).await, 3);

        let distributed = Arc::new(
            DistributedWindowLimiter::new(MemoryWindowStore::new(), &quota, DistributedConfig::default()).unwrap(),
        );
        assert_eq!(admitted(&KeyHandle::new(distributed, "a"), 5).await, 3);
    }

    #[tokio::test]
    async fn test_integration_throttle_over_keyed_registry() {
        let registry = Arc::new(
            PerKeyLimiter::sliding_windows(&Quota::per_second(2), EvictionConfig::manual(Duration::from_secs(60)))
                .unwrap(),
        );
        let tenant = KeyHandle::new(registry.clone(), "tenant:7");

        for i in 0..2 {
            let out = throttle(&tenant, std::future::pending(), || async move { i * 10 })
                .await
                .unwrap();
            assert_eq!(out, i * 10);
        }

        let result = throttle(&tenant, tokio::time::sleep(Duration::from_millis(10)), || async {}).await;
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
        assert_eq!(registry.tracked_keys(), 1);
    }
}
