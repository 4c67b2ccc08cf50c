//! Exponential backoff with jitter
//!
//! Pure delay calculation: no timers, no I/O. The managers in
//! `gattling-bluez` own the scheduling; this type only answers "how long
//! until attempt N".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Backoff parameters for re-attempting a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u32,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Aggressive policy for advertising registration, which is observed to
    /// fail transiently for longer stretches than generic property calls.
    pub fn advertising() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay for the given 1-based attempt, in milliseconds.
    ///
    /// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`, then
    /// multiplied by a uniform jitter factor in [0.7, 1.3] to avoid
    /// thundering-herd re-registration. Never less than 1 ms for a real
    /// attempt; 0 for attempt 0.
    pub fn delay_ms(&self, attempt: u32) -> u32 {
        if attempt == 0 {
            return 0;
        }

        let exponent = (attempt - 1) as i32;
        let mut delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        delay = delay.min(self.max_delay_ms as f64);

        let jitter: f64 = rand::rng().random_range(0.7..=1.3);
        delay *= jitter;

        delay.max(1.0) as u32
    }

    /// Same as [`delay_ms`](Self::delay_ms) as a [`Duration`].
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unjittered(policy: &RetryPolicy, attempt: u32) -> f64 {
        (policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32 - 1))
            .min(policy.max_delay_ms as f64)
    }

    #[test]
    fn attempt_zero_is_free() {
        assert_eq!(RetryPolicy::default().delay_ms(0), 0);
    }

    #[test]
    fn delays_stay_within_jitter_band() {
        let policy = RetryPolicy::default();
        for attempt in 1..=policy.max_attempts {
            let expected = unjittered(&policy, attempt);
            for _ in 0..50 {
                let delay = policy.delay_ms(attempt) as f64;
                assert!(
                    delay >= expected * 0.7 - 1.0 && delay <= expected * 1.3 + 1.0,
                    "attempt {attempt}: {delay} outside [{} , {}]",
                    expected * 0.7,
                    expected * 1.3
                );
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 4000,
            backoff_multiplier: 2.0,
        };
        for _ in 0..50 {
            // Attempt 9 would be 256s unclamped.
            assert!(policy.delay_ms(9) <= (4000.0 * 1.3) as u32 + 1);
        }
    }

    #[test]
    fn delay_has_floor_of_one_ms() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
        };
        for attempt in 1..=3 {
            assert!(policy.delay_ms(attempt) >= 1);
        }
    }

    proptest! {
        // Within the jitter band, delays are non-decreasing in the attempt
        // number for any multiplier >= 1: the lower band edge of attempt n+1
        // can undercut the upper edge of attempt n, so compare band centers.
        #[test]
        fn unjittered_delays_monotonic(base in 1u32..10_000, cap in 1u32..60_000, mult in 1.0f64..4.0) {
            let policy = RetryPolicy {
                max_attempts: 8,
                base_delay_ms: base,
                max_delay_ms: cap.max(base),
                backoff_multiplier: mult,
            };
            for attempt in 1..8 {
                prop_assert!(unjittered(&policy, attempt) <= unjittered(&policy, attempt + 1));
            }
        }

        #[test]
        fn jittered_delay_in_band(base in 1u32..10_000, attempt in 1u32..8) {
            let policy = RetryPolicy { base_delay_ms: base, ..RetryPolicy::default() };
            let expected = unjittered(&policy, attempt);
            let delay = policy.delay_ms(attempt) as f64;
            prop_assert!(delay >= (expected * 0.7 - 1.0).max(1.0));
            prop_assert!(delay <= expected * 1.3 + 1.0);
        }
    }
}
