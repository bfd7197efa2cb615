//! Reconnect backoff
//!
//! Exponential delay with a cap and proportional jitter so that many
//! clients dropped at once do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Backoff policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    base: Duration,
    /// Maximum delay
    cap: Duration,
    /// Fraction of the delay that is randomized, in [0, 1]
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt, without jitter
    ///
    /// `base * 2^attempt`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    /// Delay before the next attempt
    ///
    /// Uniform in `[ceiling * (1 - jitter), ceiling]`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 {
            return ceiling;
        }
        let factor = 1.0 - self.jitter * rng.gen::<f64>();
        ceiling.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exponential_growth() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(backoff.delay(0, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff.delay(1, &mut rng), Duration::from_secs(2));
        assert_eq!(backoff.delay(2, &mut rng), Duration::from_secs(4));
        assert_eq!(backoff.delay(5, &mut rng), Duration::from_secs(32));
    }

    #[test]
    fn test_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        assert_eq!(backoff.ceiling(6), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.5);
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 0..10 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.delay(attempt, &mut rng);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn test_jitter_clamped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 3.0);
        let mut rng = StdRng::seed_from_u64(1);
        // Full jitter still never exceeds the ceiling
        assert!(backoff.delay(0, &mut rng) <= Duration::from_millis(100));
    }
}
