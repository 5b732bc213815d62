//! Sliding Log admission shared across processes through an external store.
//!
//! Every admission inserts unique members into the key's sorted set inside
//! one atomic transaction and reads the count that was there before. When
//! that count already met the limit, the inserted members are deleted again.
//! Two racing callers can both insert before either compensates, so the set
//! may briefly hold one extra member per racing caller. It settles back to
//! at most `max` once the compensating deletes land.
//!
//! A compensating delete that fails leaves its member in place until the
//! window drops it. That overshoot is logged and otherwise accepted. A store
//! round-trip that times out may still have been applied, so its members are
//! deleted on the same best-effort basis before the timeout is returned.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::algorithm::{Attempt, KeyedLimiter, retry_until_admitted};
use crate::clock::{SharedClock, SystemClock, unix_micros};
use crate::error::{AdmissionError, Result, StoreError};
use crate::jitter::{JitterCalculator, JitterStrategy};
use crate::quota::Quota;
use crate::storage::{WindowAdmission, WindowStore};

/// Distributed limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Prefix joined to every key with `:` (default: `rl`).
    pub key_prefix: String,
    /// Upper bound on each store round-trip (default: 1 second).
    pub timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rl".to_string(),
            timeout: Duration::from_secs(1),
        }
    }
}

impl DistributedConfig {
    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the store round-trip timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sliding Log limiter backed by a [`WindowStore`].
///
/// Store failures are returned as [`AdmissionError::Store`], never turned
/// into an allow or a deny; the caller picks fail-open or fail-closed.
///
/// # Example
///
/// ```ignore
/// use skp_throttle::{DistributedConfig, DistributedWindowLimiter, KeyedLimiter, Quota};
/// use skp_throttle::storage::RedisWindowStore;
///
/// let store = RedisWindowStore::from_url("redis://localhost:6379").await?;
/// let limiter = DistributedWindowLimiter::new(store, &Quota::per_minute(100), DistributedConfig::default())?;
///
/// match limiter.allow("api-key:42").await {
///     Ok(true) => { /* admitted */ }
///     Ok(false) => { /* reject with 429 */ }
///     Err(err) => { /* store down: choose fail-open or fail-closed */ }
/// }
/// ```
#[derive(Debug)]
pub struct DistributedWindowLimiter<S> {
    store: S,
    max: u64,
    window: Duration,
    /// Average spacing between admissions, used as the retry base delay.
    retry_base: Duration,
    config: DistributedConfig,
    clock: SharedClock,
    jitter: JitterCalculator,
}

impl<S: WindowStore> DistributedWindowLimiter<S> {
    /// Admit at most `quota.max_requests()` per key per trailing `quota.window()`.
    pub fn new(store: S, quota: &Quota, config: DistributedConfig) -> Result<Self> {
        quota.validate()?;
        Ok(Self {
            store,
            max: quota.max_requests(),
            window: quota.window(),
            retry_base: quota.period(),
            config,
            clock: SystemClock::shared(),
            jitter: JitterCalculator::new(JitterStrategy::Equal),
        })
    }

    /// Read wall-clock scores from `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `jitter` for the retry delays of blocking waits.
    pub fn with_jitter(mut self, jitter: JitterCalculator) -> Self {
        self.jitter = jitter;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store key used for `key`.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Try to admit `n` requests for `key` at once.
    ///
    /// `n == 0` is admitted without touching the store.
    pub async fn allow_n(&self, key: &str, n: u32) -> Result<bool> {
        if n == 0 {
            return Ok(true);
        }

        let store_key = self.store_key(key);
        let score = unix_micros(self.clock.system_now());
        let window_micros = u64::try_from(self.window.as_micros()).unwrap_or(u64::MAX);
        let members: Vec<String> = (0..n).map(|_| member_id(score)).collect();

        let admission = WindowAdmission {
            key: &store_key,
            min_score: score.saturating_sub(window_micros),
            score,
            members: &members,
            ttl: self.window.checked_mul(2).unwrap_or(Duration::MAX),
        };
        let before = match self.bounded(self.store.admit(admission)).await {
            Ok(before) => before,
            Err(err) => {
                // A timed-out transaction may still have been applied.
                if matches!(err, AdmissionError::Store(StoreError::Timeout(_))) {
                    self.compensate(&store_key, &members).await;
                }
                return Err(err);
            }
        };

        if before + u64::from(n) <= self.max {
            return Ok(true);
        }

        debug!(key = %store_key, count = before, max = self.max, "distributed window full");
        self.compensate(&store_key, &members).await;
        Ok(false)
    }

    /// Best-effort delete of members this call inserted.
    async fn compensate(&self, store_key: &str, members: &[String]) {
        if let Err(err) = self.bounded(self.store.remove(store_key, members)).await {
            warn!(
                key = %store_key,
                error = %err,
                "compensating delete failed; window may exceed its limit until entries expire"
            );
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.config.timeout).into()),
        }
    }
}

/// Unique sorted-set member: `<unix micros>-<uuid>`.
fn member_id(micros: u64) -> String {
    format!("{}-{}", micros, Uuid::new_v4().simple())
}

impl<S: WindowStore> KeyedLimiter for DistributedWindowLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        self.allow_n(key, 1).await
    }

    async fn wait_n<C>(&self, key: &str, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()> + Send,
    {
        if u64::from(n) > self.max {
            return Err(AdmissionError::Unsatisfiable {
                requested: n,
                capacity: self.max as f64,
            });
        }
        let base = self.retry_base;
        retry_until_admitted(
            || async move {
                Ok(if self.allow_n(key, n).await? {
                    Attempt::Admitted
                } else {
                    Attempt::RetryAfter(base)
                })
            },
            &self.jitter,
            self.window,
            cancel,
        )
        .await
    }
}
