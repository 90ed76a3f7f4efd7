//! Retry backoff policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest exponent applied to `first_interval`; beyond this the cap always wins.
const MAX_EXPONENT: u32 = 62;

/// Backoff policy of one operation class.
///
/// Travels inside every job so a redelivered or retried job recomputes the
/// same delays without consulting configuration again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// 0 means never retry
    pub max_retries: u32,
    /// Exponential when true, linear otherwise
    pub exponential: bool,
    /// Seconds before the first retry
    pub first_interval: f64,
    /// Seconds added per attempt (linear only)
    pub step: f64,
    /// Upper bound in seconds
    pub max_interval: f64,
    /// Replace the delay with a uniform value in `[0, delay]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            exponential: true,
            first_interval: 2.0,
            step: 2.0,
            max_interval: 300.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Whether another attempt is allowed after attempt `attempt` (0-based) failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay in seconds before retrying after attempt `attempt` (0-based).
    ///
    /// Callers check [`should_retry`](Self::should_retry) first;
    /// `max_retries == 0` is not consulted here.
    #[must_use]
    pub fn delay_secs(&self, attempt: u32) -> f64 {
        let delay = if self.exponential {
            let factor = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
            self.first_interval * factor
        } else {
            self.first_interval + f64::from(attempt) * self.step
        };
        let delay = delay.min(self.max_interval).max(0.0);

        if self.jitter && delay > 0.0 {
            rand::thread_rng().gen_range(0.0..=delay)
        } else {
            delay
        }
    }

    /// [`delay_secs`](Self::delay_secs) as a `Duration`, saturating at `Duration::MAX`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        secs_to_duration(self.delay_secs(attempt))
    }

    /// Check that every interval is finite, non-negative and below the cap.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("first_interval", self.first_interval),
            ("step", self.step),
            ("max_interval", self.max_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a finite, non-negative number of seconds"));
            }
        }
        if self.max_interval < self.first_interval {
            return Err(format!(
                "max_interval ({}) is below first_interval ({})",
                self.max_interval, self.first_interval
            ));
        }
        Ok(())
    }
}

/// Seconds to a `Duration`; negative or NaN is zero, too large saturates.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            exponential: false,
            first_interval: 2.0,
            step: 5.0,
            max_interval: 10.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = BackoffPolicy {
            first_interval: 2.0,
            max_interval: 60.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_secs(0), 2.0);
        assert_eq!(policy.delay_secs(1), 4.0);
        assert_eq!(policy.delay_secs(2), 8.0);
        assert_eq!(policy.delay_secs(5), 60.0);
        assert_eq!(policy.delay_secs(u32::MAX), 60.0);
    }

    #[test]
    fn test_exponential_is_monotonic_until_cap() {
        let policy = BackoffPolicy {
            first_interval: 0.5,
            max_interval: 1000.0,
            ..BackoffPolicy::default()
        };
        let mut previous = 0.0;
        for attempt in 0..80 {
            let delay = policy.delay_secs(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            assert!(delay <= policy.max_interval);
            previous = delay;
        }
        assert_eq!(previous, policy.max_interval);
    }

    #[test]
    fn test_linear_delays() {
        let policy = linear();
        assert_eq!(policy.delay_secs(0), 2.0);
        assert_eq!(policy.delay_secs(1), 7.0);
        assert_eq!(policy.delay_secs(2), 10.0);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let policy = BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        };
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: true,
            ..linear()
        };
        for _ in 0..200 {
            let delay = policy.delay_secs(1);
            assert!((0.0..=7.0).contains(&delay));
        }
    }

    #[test]
    fn test_huge_interval_saturates() {
        let policy = BackoffPolicy {
            first_interval: 1e20,
            max_interval: 1e20,
            ..BackoffPolicy::default()
        };
        assert!(policy.validate().is_ok());
        assert_eq!(policy.delay(0), Duration::MAX);
        assert_eq!(policy.delay(3), Duration::MAX);
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_validate() {
        assert!(linear().validate().is_ok());

        let bad_cap = BackoffPolicy {
            max_interval: 1.0,
            ..linear()
        };
        assert!(bad_cap.validate().is_err());

        let negative = BackoffPolicy {
            step: -1.0,
            ..linear()
        };
        assert!(negative.validate().is_err());

        let infinite = BackoffPolicy {
            max_interval: f64::INFINITY,
            ..linear()
        };
        assert!(infinite.validate().is_err());
    }
}
