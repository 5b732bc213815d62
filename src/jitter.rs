//! Randomized delays for retry loops.
//!
//! Waiting callers that all wake at the same instant hammer the limiter in
//! lockstep. Jitter spreads them out. Three strategies are provided:
//!
//! | Strategy | Result range |
//! |----------|--------------|
//! | Full | `[0, base)` |
//! | Equal | `[base/2, base)` |
//! | Decorrelated | `[base, 3*base)` |
//!
//! Decorrelated jitter grows when a caller feeds each result back in as the
//! next `base`; the calculator keeps no history of its own.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

/// Jitter strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// `uniform(0, base)`.
    #[default]
    Full,
    /// `base/2 + uniform(0, base/2)`.
    Equal,
    /// `base + uniform(0, 2*base)`.
    Decorrelated,
}

/// Compute a jittered delay.
///
/// Returns zero for a zero `base`. A non-zero `cap` clamps the result.
pub fn jitter<R: Rng + ?Sized>(
    strategy: JitterStrategy,
    base: Duration,
    cap: Duration,
    rng: &mut R,
) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }

    let r: f64 = rng.r#gen();
    let delay = match strategy {
        JitterStrategy::Full => scaled(base, r),
        JitterStrategy::Equal => {
            let half = base / 2;
            half.saturating_add(scaled(half, r))
        }
        JitterStrategy::Decorrelated => base.saturating_add(scaled(base, 2.0 * r)),
    };

    if cap.is_zero() { delay } else { delay.min(cap) }
}

fn scaled(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Jitter calculator owning its own random source.
///
/// Each calculator has a private generator, so two limiters never share
/// randomness and tests can seed them independently.
pub struct JitterCalculator {
    strategy: JitterStrategy,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl fmt::Debug for JitterCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitterCalculator")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl JitterCalculator {
    /// Create a calculator seeded from OS entropy.
    pub fn new(strategy: JitterStrategy) -> Self {
        Self::with_rng(strategy, StdRng::from_entropy())
    }

    /// Create a deterministic calculator.
    pub fn seeded(strategy: JitterStrategy, seed: u64) -> Self {
        Self::with_rng(strategy, StdRng::seed_from_u64(seed))
    }

    /// Create a calculator drawing from the given generator.
    pub fn with_rng(strategy: JitterStrategy, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            strategy,
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Get the configured strategy.
    pub fn strategy(&self) -> JitterStrategy {
        self.strategy
    }

    /// Compute a jittered delay from `base`, clamped to `cap` when `cap` is non-zero.
    pub fn duration(&self, base: Duration, cap: Duration) -> Duration {
        let mut rng = self.rng.lock();
        jitter(self.strategy, base, cap, &mut *rng)
    }
}

impl Default for JitterCalculator {
    fn default() -> Self {
        Self::new(JitterStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: usize = 10_000;

    fn samples(strategy: JitterStrategy, base: Duration, cap: Duration) -> Vec<Duration> {
        let calc = JitterCalculator::seeded(strategy, 42);
        (0..SAMPLES).map(|_| calc.duration(base, cap)).collect()
    }

    #[test]
    fn test_all_strategies_within_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);

        for strategy in [
            JitterStrategy::Full,
            JitterStrategy::Equal,
            JitterStrategy::Decorrelated,
        ] {
            for d in samples(strategy, base, cap) {
                assert!(d <= cap, "{strategy:?} produced {d:?}");
            }
        }
    }

    #[test]
    fn test_full_jitter_mean() {
        let base = Duration::from_millis(100);
        let values = samples(JitterStrategy::Full, base, Duration::from_secs(1));

        let mean = values.iter().map(Duration::as_secs_f64).sum::<f64>() / SAMPLES as f64;
        let expected = base.as_secs_f64() / 2.0;
        assert!(
            (mean - expected).abs() < expected * 0.1,
            "mean {mean} too far from {expected}"
        );
    }

    #[test]
    fn test_equal_jitter_range() {
        let base = Duration::from_millis(100);
        for d in samples(JitterStrategy::Equal, base, Duration::ZERO) {
            assert!(d >= Duration::from_millis(50) && d <= base);
        }
    }

    #[test]
    fn test_decorrelated_range() {
        let base = Duration::from_millis(100);
        for d in samples(JitterStrategy::Decorrelated, base, Duration::ZERO) {
            assert!(d >= base && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_cap_clamps() {
        let cap = Duration::from_millis(10);
        for d in samples(JitterStrategy::Decorrelated, Duration::from_secs(1), cap) {
            assert_eq!(d, cap);
        }
    }

    #[test]
    fn test_zero_base() {
        let calc = JitterCalculator::seeded(JitterStrategy::Decorrelated, 7);
        assert_eq!(calc.duration(Duration::ZERO, Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let a = JitterCalculator::seeded(JitterStrategy::Full, 9);
        let b = JitterCalculator::seeded(JitterStrategy::Full, 9);
        let base = Duration::from_millis(250);

        for _ in 0..100 {
            assert_eq!(a.duration(base, Duration::ZERO), b.duration(base, Duration::ZERO));
        }
    }

    #[test]
    fn test_strategy_deserialize() {
        let strategy: JitterStrategy = serde_json::from_str("\"decorrelated\"").unwrap();
        assert_eq!(strategy, JitterStrategy::Decorrelated);
    }
}
