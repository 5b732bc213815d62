//! Time sources.
//!
//! Every limiter reads time through a [`Clock`] handed to it at construction,
//! so tests can drive time explicitly with [`ManualClock`] instead of sleeping.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of time for limiters.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time, used for all in-process refill and window arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock time, used only where state is shared between processes.
    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock shared between a limiter and whoever else holds it.
pub type SharedClock = Arc<dyn Clock>;

/// System clock backed by `Instant::now()` and `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// Create a system clock behind a [`SharedClock`].
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// pass another to the limiter under test.
///
/// ```
/// use skp_throttle::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    instant: Instant,
    system: SystemTime,
}

impl ManualClock {
    /// Create a manual clock starting at the current real time.
    pub fn new() -> Self {
        Self::starting_at(Instant::now(), SystemTime::now())
    }

    /// Create a manual clock starting at specific readings.
    pub fn starting_at(instant: Instant, system: SystemTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime { instant, system })),
        }
    }

    /// Advance both readings by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.inner.lock();
        time.instant += duration;
        time.system += duration;
    }

    /// Create a handle to this clock behind a [`SharedClock`].
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().instant
    }

    fn system_now(&self) -> SystemTime {
        self.inner.lock().system
    }
}

/// Microseconds since the Unix epoch, saturating at zero for pre-epoch readings.
pub(crate) fn unix_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
