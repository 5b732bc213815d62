//! Per-key limiter registry with idle eviction.
//!
//! Each key gets its own limiter, created lazily by a factory on first use.
//! Entries idle for longer than the TTL are swept away, either by a
//! background task or by calling [`PerKeyLimiter::evict_idle`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::algorithm::{KeyedLimiter, Limiter, TokenBucket, WindowLimiter};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{ConfigError, Result};
use crate::quota::Quota;

/// When the eviction sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepInterval {
    /// Sweep from a background task at a fixed interval.
    Every(Duration),
    /// Only sweep when [`PerKeyLimiter::evict_idle`] is called.
    Manual,
}

impl Default for SweepInterval {
    fn default() -> Self {
        Self::Every(Duration::from_secs(60))
    }
}

/// Eviction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Entries idle for longer than this are evicted (default: 10 minutes).
    pub ttl: Duration,
    /// When to sweep.
    #[serde(default)]
    pub interval: SweepInterval,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            interval: SweepInterval::default(),
        }
    }
}

impl EvictionConfig {
    /// Evict after `ttl` of inactivity, sweeping every `interval`.
    pub fn new(ttl: Duration, interval: Duration) -> Self {
        Self {
            ttl,
            interval: SweepInterval::Every(interval),
        }
    }

    /// Evict after `ttl` of inactivity, sweeping only on demand.
    pub fn manual(ttl: Duration) -> Self {
        Self {
            ttl,
            interval: SweepInterval::Manual,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidEviction("ttl must be non-zero".into()).into());
        }
        if self.interval == SweepInterval::Every(Duration::ZERO) {
            return Err(ConfigError::InvalidEviction("sweep interval must be non-zero".into()).into());
        }
        Ok(())
    }
}

struct KeyedEntry<L> {
    limiter: Arc<L>,
    last_seen: Instant,
}

type Registry<L> = DashMap<String, KeyedEntry<L>>;
type Factory<L> = Box<dyn Fn(&str) -> L + Send + Sync>;

struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry mapping keys to lazily created limiters.
///
/// The map lock is held only to look up or insert an entry; the limiter
/// itself is called after the lock is released, so admissions for
/// different keys never serialize on the registry.
///
/// # Example
///
/// ```ignore
/// use skp_throttle::{EvictionConfig, KeyedLimiter, PerKeyLimiter, Quota};
/// use std::time::Duration;
///
/// let limiter = PerKeyLimiter::token_buckets(
///     &Quota::per_second(10).with_burst(20),
///     EvictionConfig::new(Duration::from_secs(300), Duration::from_secs(30)),
/// )?;
///
/// if limiter.allow("10.0.0.7").await? {
///     // handle the request
/// }
/// limiter.stop().await;
/// ```
pub struct PerKeyLimiter<L> {
    entries: Arc<Registry<L>>,
    factory: Factory<L>,
    config: EvictionConfig,
    clock: SharedClock,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<L> std::fmt::Debug for PerKeyLimiter<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerKeyLimiter")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<L: Send + Sync + 'static> PerKeyLimiter<L> {
    /// Create a registry building limiters with `factory`.
    ///
    /// With [`SweepInterval::Every`] this spawns the sweeper, so it must be
    /// called from inside a Tokio runtime.
    pub fn new<F>(factory: F, config: EvictionConfig) -> Result<Self>
    where
        F: Fn(&str) -> L + Send + Sync + 'static,
    {
        Self::with_clock(factory, config, SystemClock::shared())
    }

    /// Like [`new`](Self::new), reading idle time from `clock`.
    pub fn with_clock<F>(factory: F, config: EvictionConfig, clock: SharedClock) -> Result<Self>
    where
        F: Fn(&str) -> L + Send + Sync + 'static,
    {
        config.validate()?;

        let limiter = Self {
            entries: Arc::new(DashMap::new()),
            factory: Box::new(factory),
            config,
            clock,
            sweeper: Mutex::new(None),
        };

        if let SweepInterval::Every(interval) = limiter.config.interval {
            limiter.start_sweeper(interval)?;
        }

        Ok(limiter)
    }

    fn start_sweeper(&self, interval: Duration) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let entries = self.entries.clone();
        let clock = self.clock.clone();
        let ttl = self.config.ttl;
        let (shutdown, mut stopped) = oneshot::channel();

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let evicted = sweep(&entries, &clock, ttl);
                        if evicted > 0 {
                            debug!(evicted, remaining = entries.len(), "evicted idle limiters");
                        }
                    }
                }
            }
        });

        *self.sweeper.lock() = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    /// Get the limiter for `key`, creating it on first use.
    pub fn limiter(&self, key: &str) -> Arc<L> {
        let now = self.clock.now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_seen = now;
            return entry.limiter.clone();
        }

        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| KeyedEntry {
                limiter: Arc::new((self.factory)(key)),
                last_seen: now,
            });
        entry.last_seen = now;
        entry.limiter.clone()
    }

    /// Remove entries idle for longer than the TTL. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        sweep(&self.entries, &self.clock, self.config.ttl)
    }

    /// Check whether `key` currently has a limiter.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop the limiter for `key`; the next use starts fresh.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        let Some(sweeper) = sweeper else {
            return;
        };
        let _ = sweeper.shutdown.send(());
        if let Err(err) = sweeper.handle.await {
            warn!(error = %err, "eviction sweeper did not shut down cleanly");
        }
    }

    /// Check whether a background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl PerKeyLimiter<TokenBucket> {
    /// Registry of token buckets sized from `quota`.
    pub fn token_buckets(quota: &Quota, config: EvictionConfig) -> Result<Self> {
        Self::token_buckets_with_clock(quota, config, SystemClock::shared())
    }

    /// Registry of token buckets sharing `clock`.
    pub fn token_buckets_with_clock(
        quota: &Quota,
        config: EvictionConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let template = TokenBucket::from_quota(quota)?;
        let (capacity, rate) = (template.capacity(), template.rate());
        let bucket_clock = clock.clone();
        Self::with_clock(
            move |_| TokenBucket::from_valid(capacity, rate, bucket_clock.clone()),
            config,
            clock,
        )
    }
}

impl PerKeyLimiter<WindowLimiter> {
    /// Registry of sliding window logs sized from `quota`.
    pub fn sliding_windows(quota: &Quota, config: EvictionConfig) -> Result<Self> {
        Self::sliding_windows_with_clock(quota, config, SystemClock::shared())
    }

    /// Registry of sliding window logs sharing `clock`.
    pub fn sliding_windows_with_clock(
        quota: &Quota,
        config: EvictionConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        quota.validate()?;
        let quota = quota.clone();
        let window_clock = clock.clone();
        Self::with_clock(
            move |_| WindowLimiter::from_valid_quota(&quota, window_clock.clone()),
            config,
            clock,
        )
    }
}

impl<L> Drop for PerKeyLimiter<L> {
    fn drop(&mut self) {
        // The task exits on its own once signalled.
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            let _ = sweeper.shutdown.send(());
        }
    }
}

/// Remove entries idle past `ttl`. Never touches a limiter's own lock.
///
/// An entry whose limiter is still held outside the registry (a blocked
/// waiter, a handle from [`PerKeyLimiter::limiter`]) is kept, so a key never
/// has two live limiters.
fn sweep<L>(entries: &Registry<L>, clock: &SharedClock, ttl: Duration) -> usize {
    let now = clock.now();
    let before = entries.len();
    entries.retain(|_, entry| {
        Arc::strong_count(&entry.limiter) > 1 || now.saturating_duration_since(entry.last_seen) <= ttl
    });
    before.saturating_sub(entries.len())
}

impl<L: Limiter> KeyedLimiter for PerKeyLimiter<L> {
    async fn allow(&self, key: &str) -> Result<bool> {
        let limiter = self.limiter(key);
        limiter.allow().await
    }

    async fn wait_n<C>(&self, key: &str, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()> + Send,
    {
        let limiter = self.limiter(key);
        limiter.wait_n(n, cancel).await
    }
}
