//! Sliding Log admission.
//!
//! The Sliding Log stores the timestamp of every admission inside the
//! window. Counting is exact with no boundary bursts, at the cost of up to
//! `max` timestamps per active key.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::algorithm::{Attempt, KeyedLimiter, Limiter, retry_until_admitted};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{AdmissionError, Result};
use crate::jitter::{JitterCalculator, JitterStrategy};
use crate::quota::Quota;

/// Ordered log of admission timestamps for one key.
#[derive(Debug, Clone, Default)]
pub struct WindowLog {
    timestamps: VecDeque<Instant>,
}

impl WindowLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every timestamp older than `now - window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self.timestamps.front().is_some_and(|&ts| ts < cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Prune, then record `n` admissions at `now` if they fit under `max`.
    pub fn admit(&mut self, now: Instant, window: Duration, max: usize, n: usize) -> bool {
        self.prune(now, window);
        if self.timestamps.len() + n > max {
            return false;
        }
        self.timestamps.extend(std::iter::repeat_n(now, n));
        true
    }

    /// How long until `n` more admissions would fit. Zero if they fit now.
    ///
    /// Call after [`prune`](Self::prune) with the same `now`.
    pub fn retry_after(&self, now: Instant, window: Duration, max: usize, n: usize) -> Duration {
        let len = self.timestamps.len();
        if len + n <= max {
            return Duration::ZERO;
        }
        // The entry that has to expire before `n` slots are free.
        let blocking = len + n - max - 1;
        self.timestamps
            .get(blocking)
            .map(|&ts| (ts + window).saturating_duration_since(now))
            .unwrap_or(window)
    }

    /// Number of timestamps held.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Shared parameters of the window limiters.
#[derive(Debug)]
struct WindowPolicy {
    max: usize,
    window: Duration,
    clock: SharedClock,
    jitter: JitterCalculator,
}

impl WindowPolicy {
    fn from_quota(quota: &Quota) -> Result<Self> {
        quota.validate()?;
        Ok(Self::from_valid(quota, SystemClock::shared()))
    }

    fn from_valid(quota: &Quota, clock: SharedClock) -> Self {
        Self {
            max: quota.max_requests().min(usize::MAX as u64) as usize,
            window: quota.window(),
            clock,
            jitter: JitterCalculator::new(JitterStrategy::Equal),
        }
    }

    fn check_satisfiable(&self, n: u32) -> Result<()> {
        if n as usize > self.max {
            return Err(AdmissionError::Unsatisfiable {
                requested: n,
                capacity: self.max as f64,
            });
        }
        Ok(())
    }

    fn attempt(&self, log: &mut WindowLog, n: usize) -> Attempt {
        let now = self.clock.now();
        if log.admit(now, self.window, self.max, n) {
            Attempt::Admitted
        } else {
            Attempt::RetryAfter(log.retry_after(now, self.window, self.max, n))
        }
    }
}

/// Sliding Log limiter for a single key.
#[derive(Debug)]
pub struct WindowLimiter {
    log: Mutex<WindowLog>,
    policy: WindowPolicy,
}

impl WindowLimiter {
    /// Admit at most `quota.max_requests()` per trailing `quota.window()`.
    pub fn from_quota(quota: &Quota) -> Result<Self> {
        Ok(Self {
            log: Mutex::new(WindowLog::new()),
            policy: WindowPolicy::from_quota(quota)?,
        })
    }

    /// Build from a quota that has already passed [`Quota::validate`].
    pub(crate) fn from_valid_quota(quota: &Quota, clock: SharedClock) -> Self {
        Self {
            log: Mutex::new(WindowLog::new()),
            policy: WindowPolicy::from_valid(quota, clock),
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.policy.clock = clock;
        self
    }

    /// Use `jitter` for the retry delays of blocking waits.
    pub fn with_jitter(mut self, jitter: JitterCalculator) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Try to admit one request without waiting.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Try to admit `n` requests at once without waiting.
    pub fn try_acquire_n(&self, n: u32) -> bool {
        let now = self.policy.clock.now();
        self.log
            .lock()
            .admit(now, self.policy.window, self.policy.max, n as usize)
    }

    /// How long until the next request would be admitted.
    pub fn retry_after(&self) -> Duration {
        let now = self.policy.clock.now();
        let mut log = self.log.lock();
        log.prune(now, self.policy.window);
        log.retry_after(now, self.policy.window, self.policy.max, 1)
    }
}

impl Limiter for WindowLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_acquire())
    }

    async fn wait_n<C>(&self, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()> + Send,
    {
        self.policy.check_satisfiable(n)?;
        let policy = &self.policy;
        let log = &self.log;
        retry_until_admitted(
            || async move { Ok(policy.attempt(&mut log.lock(), n as usize)) },
            &policy.jitter,
            policy.window,
            cancel,
        )
        .await
    }
}

/// Sliding Log limiter over a key space.
///
/// Logs live in a sharded map, so admissions for unrelated keys rarely
/// contend on the same lock.
///
/// Every distinct key keeps an entry until [`cleanup`](Self::cleanup) finds
/// its log empty. Call `cleanup` periodically when keys are unbounded (client
/// addresses, tokens), or use
/// [`PerKeyLimiter::sliding_windows`](crate::PerKeyLimiter::sliding_windows),
/// which evicts idle keys on its own.
#[derive(Debug)]
pub struct SlidingWindowLog {
    logs: DashMap<String, WindowLog>,
    policy: WindowPolicy,
}

impl SlidingWindowLog {
    /// Admit at most `quota.max_requests()` per key per trailing `quota.window()`.
    pub fn from_quota(quota: &Quota) -> Result<Self> {
        Ok(Self {
            logs: DashMap::new(),
            policy: WindowPolicy::from_quota(quota)?,
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.policy.clock = clock;
        self
    }

    /// Use `jitter` for the retry delays of blocking waits.
    pub fn with_jitter(mut self, jitter: JitterCalculator) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Try to admit one request for `key` without waiting.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_n(key, 1)
    }

    /// Try to admit `n` requests for `key` at once without waiting.
    pub fn try_acquire_n(&self, key: &str, n: u32) -> bool {
        matches!(self.attempt(key, n as usize), Attempt::Admitted)
    }

    /// How long until the next request for `key` would be admitted.
    pub fn retry_after(&self, key: &str) -> Duration {
        let Some(mut log) = self.logs.get_mut(key) else {
            return Duration::ZERO;
        };
        let now = self.policy.clock.now();
        log.prune(now, self.policy.window);
        log.retry_after(now, self.policy.window, self.policy.max, 1)
    }

    /// Forget the log for `key`.
    pub fn reset(&self, key: &str) {
        self.logs.remove(key);
    }

    /// Drop keys whose logs are empty once pruned.
    pub fn cleanup(&self) {
        let now = self.policy.clock.now();
        let window = self.policy.window;
        self.logs.retain(|_, log| {
            log.prune(now, window);
            !log.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }

    fn attempt(&self, key: &str, n: usize) -> Attempt {
        if let Some(mut log) = self.logs.get_mut(key) {
            return self.policy.attempt(&mut log, n);
        }
        let mut log = self.logs.entry(key.to_owned()).or_default();
        self.policy.attempt(&mut log, n)
    }
}

impl KeyedLimiter for SlidingWindowLog {
    async fn allow(&self, key: &str) -> Result<bool> {
        Ok(self.try_acquire(key))
    }

    async fn wait_n<C>(&self, key: &str, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()> + Send,
    {
        self.policy.check_satisfiable(n)?;
        retry_until_admitted(
            || async move { Ok(self.attempt(key, n as usize)) },
            &self.policy.jitter,
            self.policy.window,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual_log(max: u64, window: Duration) -> (SlidingWindowLog, ManualClock) {
        let clock = ManualClock::new();
        let log = SlidingWindowLog::from_quota(&Quota::new(max, window))
            .unwrap()
            .with_clock(clock.shared());
        (log, clock)
    }

    #[test]
    fn test_sliding_log_exact_window() {
        let (log, clock) = manual_log(3, Duration::from_secs(1));

        for i in 1..=3 {
            assert!(log.try_acquire("k"), "Request {} should be allowed", i);
        }
        assert!(!log.try_acquire("k"));

        clock.advance(Duration::from_millis(1001));
        assert!(log.try_acquire("k"));
    }

    #[test]
    fn test_entry_at_window_edge_still_counts() {
        let (log, clock) = manual_log(1, Duration::from_secs(1));
        assert!(log.try_acquire("k"));

        clock.advance(Duration::from_secs(1));
        assert!(!log.try_acquire("k"));

        clock.advance(Duration::from_millis(1));
        assert!(log.try_acquire("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let (log, _clock) = manual_log(1, Duration::from_secs(60));
        assert!(log.try_acquire("a"));
        assert!(!log.try_acquire("a"));
        assert!(log.try_acquire("b"));
        assert_eq!(log.tracked_keys(), 2);
    }

    #[test]
    fn test_denied_admission_leaves_log_pruned() {
        let mut log = WindowLog::new();
        let start = Instant::now() + Duration::from_secs(10);
        let window = Duration::from_secs(1);

        assert!(log.admit(start, window, 2, 1));
        assert!(log.admit(start + Duration::from_millis(600), window, 2, 1));
        assert!(!log.admit(start + Duration::from_millis(900), window, 2, 1));
        assert_eq!(log.len(), 2);

        assert!(log.admit(start + Duration::from_millis(1100), window, 2, 1));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_retry_after() {
        let (log, clock) = manual_log(2, Duration::from_secs(1));
        assert_eq!(log.retry_after("k"), Duration::ZERO);

        assert!(log.try_acquire("k"));
        clock.advance(Duration::from_millis(300));
        assert!(log.try_acquire("k"));

        assert_eq!(log.retry_after("k"), Duration::from_millis(700));
    }

    #[test]
    fn test_try_acquire_n_is_all_or_nothing() {
        let (log, _clock) = manual_log(3, Duration::from_secs(1));
        assert!(log.try_acquire_n("k", 2));
        assert!(!log.try_acquire_n("k", 2));
        assert!(log.try_acquire_n("k", 1));
    }

    #[test]
    fn test_cleanup_and_reset() {
        let (log, clock) = manual_log(5, Duration::from_secs(1));
        assert!(log.try_acquire("old"));
        clock.advance(Duration::from_secs(2));
        assert!(log.try_acquire("fresh"));

        log.cleanup();
        assert_eq!(log.tracked_keys(), 1);

        log.reset("fresh");
        assert_eq!(log.tracked_keys(), 0);
    }

    #[test]
    fn test_cleanup_reclaims_one_shot_keys() {
        let (log, clock) = manual_log(1, Duration::from_secs(1));
        for i in 0..500 {
            assert!(log.try_acquire(&format!("client:{i}")));
        }
        assert_eq!(log.tracked_keys(), 500);

        clock.advance(Duration::from_millis(500));
        log.cleanup();
        assert_eq!(log.tracked_keys(), 500);

        clock.advance(Duration::from_millis(501));
        log.cleanup();
        assert_eq!(log.tracked_keys(), 0);
    }

    #[test]
    fn test_window_limiter_single_key() {
        let clock = ManualClock::new();
        let limiter = WindowLimiter::from_quota(&Quota::new(2, Duration::from_secs(1)))
            .unwrap()
            .with_clock(clock.shared());

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.retry_after(), Duration::from_secs(1));

        clock.advance(Duration::from_millis(1001));
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_unsatisfiable() {
        let (log, _clock) = manual_log(3, Duration::from_secs(1));
        let result = KeyedLimiter::wait_n(&log, "k", 4, std::future::pending()).await;
        assert!(matches!(result, Err(AdmissionError::Unsatisfiable { .. })));
    }

    #[tokio::test]
    async fn test_wait_cancelled_when_window_full() {
        let (log, _clock) = manual_log(1, Duration::from_secs(60));
        assert!(log.try_acquire("k"));

        let result = KeyedLimiter::wait(&log, "k", tokio::time::sleep(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_admits_once_window_slides() {
        let limiter = WindowLimiter::from_quota(&Quota::new(1, Duration::from_millis(50))).unwrap();
        assert!(limiter.try_acquire());

        tokio::time::timeout(Duration::from_secs(2), limiter.wait(std::future::pending()))
            .await
            .expect("window should slide")
            .unwrap();
        assert!(!limiter.try_acquire());
    }
}
