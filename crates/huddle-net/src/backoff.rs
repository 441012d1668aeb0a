//! Reconnect backoff policy for the signaling transport.

use std::time::Duration;

use rand::Rng;

use huddle_shared::constants::{RECONNECT_INITIAL_MS, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_MS};

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Attempts before the transport gives up. Zero disables reconnects.
    pub max_attempts: u32,
    /// Fraction of the delay randomised (0.0 = deterministic).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(RECONNECT_INITIAL_MS),
            max: Duration::from_millis(RECONNECT_MAX_MS),
            multiplier: 2.0,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Base delay for a 1-based attempt number, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to wait before `attempt`, or `None` once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return Some(base);
        }

        let spread = base.as_millis() as f64 * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (base.as_millis() as f64 + offset).clamp(0.0, self.max.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: 0.0,
        };

        assert_eq!(backoff.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay(4), Some(Duration::from_millis(800)));
        assert_eq!(backoff.delay(5), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(9), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_exhaustion() {
        let backoff = Backoff {
            max_attempts: 3,
            ..Backoff::default()
        };
        assert!(backoff.delay(3).is_some());
        assert!(backoff.delay(4).is_none());
        assert!(backoff.delay(0).is_none());
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(5000),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = backoff.delay(1).unwrap();
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1500));
        }
    }
}
