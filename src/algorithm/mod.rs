//! Admission capability traits and the in-process limiters.
//!
//! Middleware, interceptors and the [`throttle`] helper are written once
//! against [`Limiter`]. Keyed limiters implement [`KeyedLimiter`] and can be
//! narrowed to a single key with [`KeyHandle`].
//!
//! # Available Limiters
//!
//! | Limiter | Keyed | Blocking wait |
//! |---------|-------|---------------|
//! | [`TokenBucket`] | no | notify-all rendezvous |
//! | [`WindowLimiter`] | no | retry with jitter |
//! | [`SlidingWindowLog`] | yes | retry with jitter |
//! | [`PerKeyLimiter`](crate::PerKeyLimiter) | yes | delegates |
//! | [`DistributedWindowLimiter`](crate::DistributedWindowLimiter) | yes | retry with jitter |

mod sliding_log;
mod token_bucket;

pub use sliding_log::{SlidingWindowLog, WindowLimiter, WindowLog};
pub use token_bucket::TokenBucket;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{AdmissionError, Result};
use crate::jitter::JitterCalculator;

/// Admission capability.
///
/// `allow` is the non-blocking check; `wait` and `wait_n` suspend until
/// admitted or until `cancel` resolves. A cancelled wait returns
/// [`AdmissionError::Cancelled`] and consumes nothing.
pub trait Limiter: Send + Sync + 'static {
    /// Try to admit one request now.
    fn allow(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Wait until `n` permits are admitted together.
    ///
    /// `n == 0` succeeds immediately. A request that can never fit fails
    /// with [`AdmissionError::Unsatisfiable`] without waiting.
    fn wait_n<C>(&self, n: u32, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send;

    /// Wait until one permit is admitted.
    fn wait<C>(&self, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send,
    {
        self.wait_n(1, cancel)
    }
}

/// Admission capability over a key space.
pub trait KeyedLimiter: Send + Sync + 'static {
    /// Try to admit one request for `key` now.
    fn allow(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Wait until `n` permits for `key` are admitted together.
    fn wait_n<C>(&self, key: &str, n: u32, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send;

    /// Wait until one permit for `key` is admitted.
    fn wait<C>(&self, key: &str, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send,
    {
        self.wait_n(key, 1, cancel)
    }
}

impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    fn allow(&self) -> impl Future<Output = Result<bool>> + Send {
        (**self).allow()
    }

    fn wait_n<C>(&self, n: u32, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send,
    {
        (**self).wait_n(n, cancel)
    }
}

/// A keyed limiter bound to one key.
///
/// ```ignore
/// let log = Arc::new(SlidingWindowLog::from_quota(&Quota::per_second(3))?);
/// let tenant = KeyHandle::new(log, "tenant:7");
/// throttle(&tenant, std::future::pending(), || async { handle().await }).await?;
/// ```
#[derive(Debug)]
pub struct KeyHandle<K> {
    limiter: Arc<K>,
    key: String,
}

impl<K> KeyHandle<K> {
    /// Bind `limiter` to `key`.
    pub fn new(limiter: Arc<K>, key: impl Into<String>) -> Self {
        Self {
            limiter,
            key: key.into(),
        }
    }

    /// The bound key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<K> Clone for KeyHandle<K> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key: self.key.clone(),
        }
    }
}

impl<K: KeyedLimiter> Limiter for KeyHandle<K> {
    fn allow(&self) -> impl Future<Output = Result<bool>> + Send {
        KeyedLimiter::allow(&*self.limiter, &self.key)
    }

    fn wait_n<C>(&self, n: u32, cancel: C) -> impl Future<Output = Result<()>> + Send
    where
        C: Future<Output = ()> + Send,
    {
        KeyedLimiter::wait_n(&*self.limiter, &self.key, n, cancel)
    }
}

/// Block on one permit, then run `operation`.
pub async fn throttle<L, C, F, Fut, T>(limiter: &L, cancel: C, operation: F) -> Result<T>
where
    L: Limiter + ?Sized,
    C: Future<Output = ()> + Send,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    limiter.wait(cancel).await?;
    Ok(operation().await)
}

/// Outcome of one admission attempt inside a retry loop.
pub(crate) enum Attempt {
    Admitted,
    RetryAfter(Duration),
}

/// Floor for retry sleeps so a zero hint cannot spin.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Repeat `attempt` until it admits, sleeping a jittered delay between tries.
pub(crate) async fn retry_until_admitted<F, Fut, C>(
    mut attempt: F,
    jitter: &JitterCalculator,
    max_delay: Duration,
    cancel: C,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt>>,
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);

    loop {
        let hint = match attempt().await? {
            Attempt::Admitted => return Ok(()),
            Attempt::RetryAfter(hint) => hint,
        };
        let delay = jitter.duration(hint, max_delay).max(MIN_RETRY_DELAY);

        tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!("admission wait cancelled");
                return Err(AdmissionError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
