//! Token Bucket admission.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::algorithm::Limiter;
use crate::clock::{SharedClock, SystemClock};
use crate::error::{AdmissionError, ConfigError, Result};
use crate::quota::Quota;

/// Token Bucket limiter.
///
/// Allows controlled bursts while enforcing an average rate.
/// Tokens are refilled at a constant rate up to capacity, measured on the
/// monotonic clock.
///
/// Blocked waiters share one [`Notify`]. Whenever a waiter's own timer fires
/// it wakes every other waiter, so each one re-runs the refill and re-checks
/// its own deficit. There is no FIFO ordering: a small request may be served
/// before a larger one that arrived earlier.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
    refilled: Notify,
    clock: SharedClock,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket holding up to `capacity` tokens, refilled at `rate` tokens/second.
    pub fn new(capacity: f64, rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ConfigError::InvalidBucket(format!(
                "capacity must be positive and finite, got {capacity}"
            ))
            .into());
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidBucket(format!(
                "rate must be positive and finite, got {rate}"
            ))
            .into());
        }

        Ok(Self::from_valid(capacity, rate, SystemClock::shared()))
    }

    /// Build a full bucket from parameters that have already been checked.
    pub(crate) fn from_valid(capacity: f64, rate: f64, clock: SharedClock) -> Self {
        Self {
            capacity,
            rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: clock.now(),
            }),
            refilled: Notify::new(),
            clock,
        }
    }

    /// Create a bucket whose capacity is the quota's burst and whose rate is its refill rate.
    pub fn from_quota(quota: &Quota) -> Result<Self> {
        quota.validate()?;
        Self::new(quota.effective_burst() as f64, quota.effective_refill_rate())
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.state.get_mut().last_refill = clock.now();
        self.clock = clock;
        self
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Try to take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Try to take `n` tokens at once without waiting.
    pub fn try_acquire_n(&self, n: u32) -> bool {
        if n == 0 {
            return true;
        }
        let need = n as f64;
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Wait for `n` tokens, or until `cancel` resolves.
    ///
    /// Tokens are only debited together with a successful sufficiency check
    /// under the lock, so a cancelled wait leaves the bucket untouched.
    pub async fn acquire_n<C>(&self, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        if n == 0 {
            return Ok(());
        }
        let need = n as f64;
        if need > self.capacity {
            return Err(AdmissionError::Unsatisfiable {
                requested: n,
                capacity: self.capacity,
            });
        }

        tokio::pin!(cancel);

        loop {
            // Register before checking so a wake between the check and the
            // select is not lost.
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= need {
                    state.tokens -= need;
                    return Ok(());
                }
                deficit_wait(need - state.tokens, self.rate)
            };

            tokio::select! {
                biased;
                _ = &mut cancel => {
                    debug!(requested = n, "token bucket wait cancelled");
                    return Err(AdmissionError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {
                    self.refilled.notify_waiters();
                }
                _ = &mut notified => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }
}

/// Time for `deficit` tokens to accrue at `rate`.
fn deficit_wait(deficit: f64, rate: f64) -> Duration {
    Duration::try_from_secs_f64(deficit / rate).unwrap_or(Duration::MAX)
}

impl Limiter for TokenBucket {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_acquire())
    }

    async fn wait_n<C>(&self, n: u32, cancel: C) -> Result<()>
    where
        C: Future<Output = ()> + Send,
    {
        self.acquire_n(n, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn manual_bucket(capacity: f64, rate: f64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(capacity, rate).unwrap().with_clock(clock.shared());
        (bucket, clock)
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(TokenBucket::new(-1.0, 1.0).is_err());
        assert!(TokenBucket::new(0.0, 1.0).is_err());
        assert!(TokenBucket::new(5.0, 0.0).is_err());
        assert!(TokenBucket::new(5.0, f64::INFINITY).is_err());
        assert!(TokenBucket::from_quota(&Quota::new(0, Duration::from_secs(1))).is_err());
    }

    #[test]
    fn test_token_bucket_burst() {
        let (bucket, _clock) = manual_bucket(10.0, 1.0);

        for i in 1..=10 {
            assert!(bucket.try_acquire(), "Burst request {} should be allowed", i);
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refill_rate_and_cap() {
        let (bucket, clock) = manual_bucket(10.0, 5.0);
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert_eq!(bucket.available(), 0.0);

        clock.advance(Duration::from_secs(1));
        assert!((bucket.available() - 5.0).abs() < 1e-9);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        clock.advance(Duration::from_secs(10));
        assert_eq!(bucket.available(), 10.0);
    }

    #[test]
    fn test_fractional_refill_accumulates() {
        let (bucket, clock) = manual_bucket(1.0, 10.0);
        assert!(bucket.try_acquire());

        clock.advance(Duration::from_millis(50));
        assert!(!bucket.try_acquire());
        clock.advance(Duration::from_millis(50));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_try_acquire_n() {
        let (bucket, _clock) = manual_bucket(5.0, 1.0);
        assert!(bucket.try_acquire_n(0));
        assert!(bucket.try_acquire_n(3));
        assert!(!bucket.try_acquire_n(3));
        assert!(bucket.try_acquire_n(2));
    }

    #[test]
    fn test_from_quota() {
        let bucket = TokenBucket::from_quota(&Quota::per_second(2).with_burst(8)).unwrap();
        assert_eq!(bucket.capacity(), 8.0);
        assert!((bucket.rate() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_wait_n_unsatisfiable() {
        let (bucket, _clock) = manual_bucket(5.0, 1.0);
        let result = bucket.acquire_n(6, std::future::pending()).await;
        assert!(matches!(
            result,
            Err(AdmissionError::Unsatisfiable { requested: 6, .. })
        ));
        assert_eq!(bucket.available(), 5.0);
    }

    #[tokio::test]
    async fn test_wait_zero_is_noop() {
        let (bucket, _clock) = manual_bucket(1.0, 1.0);
        assert!(bucket.try_acquire());
        bucket.acquire_n(0, std::future::pending()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_does_not_debit() {
        let (bucket, _clock) = manual_bucket(5.0, 1.0);
        assert!(bucket.try_acquire_n(3));
        let before = bucket.available();

        let result = bucket
            .acquire_n(4, tokio::time::sleep(Duration::from_millis(20)))
            .await;

        assert!(matches!(result, Err(AdmissionError::Cancelled)));
        assert_eq!(bucket.available(), before);
    }

    #[tokio::test]
    async fn test_wait_succeeds_after_refill() {
        let bucket = TokenBucket::new(1.0, 50.0).unwrap();
        assert!(bucket.try_acquire());

        let start = Instant::now();
        tokio::time::timeout(
            Duration::from_secs(2),
            bucket.acquire_n(1, std::future::pending()),
        )
        .await
        .expect("wait should finish")
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_never_double_spend() {
        let bucket = Arc::new(TokenBucket::new(2.0, 20.0).unwrap());
        assert!(bucket.try_acquire_n(2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire_n(1, std::future::pending()).await
            }));
        }

        let start = Instant::now();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Six tokens at 20/s cannot accrue in under ~300ms.
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_large_waiter_rechecked_after_small_waiter() {
        let bucket = Arc::new(TokenBucket::new(4.0, 40.0).unwrap());
        assert!(bucket.try_acquire_n(4));

        let big = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire_n(4, std::future::pending()).await })
        };
        let small = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire_n(1, std::future::pending()).await })
        };

        let both = async {
            small.await.unwrap().unwrap();
            big.await.unwrap().unwrap();
        };
        tokio::time::timeout(Duration::from_secs(2), both)
            .await
            .expect("both waiters should be admitted");
    }

    #[tokio::test]
    async fn test_limiter_trait() {
        let (bucket, _clock) = manual_bucket(1.0, 1.0);
        assert!(bucket.allow().await.unwrap());
        assert!(!bucket.allow().await.unwrap());
    }
}
