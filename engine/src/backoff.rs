//! Exponential backoff with bounded jitter.
//!
//! The delay for attempt `n` (0-based) is
//! `min(base * 2^n + base * jitter, max)` with `jitter` in `[0, 1)`. The
//! jitter term is smaller than one base step, so delays never decrease as the
//! attempt count grows, whatever jitter is drawn.

use serde::{Deserialize, Serialize};

/// Backoff policy shared by reconnects and queue retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// First delay (ms)
    pub base_ms: u64,
    /// Upper bound for any delay (ms)
    pub max_ms: u64,
    /// Whether jitter is added
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Create a policy.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter: true,
        }
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before attempt `attempt`, given a jitter sample in `[0, 1)`.
    ///
    /// Samples outside that range are clamped.
    pub fn delay(&self, attempt: u32, jitter_factor: f64) -> u64 {
        let exponential = self
            .base_ms
            .saturating_mul(1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX));

        let jitter = if self.jitter {
            let factor = if jitter_factor.is_finite() {
                jitter_factor.clamp(0.0, 0.999_999)
            } else {
                0.0
            };
            (self.base_ms as f64 * factor) as u64
        } else {
            0
        };

        exponential.saturating_add(jitter).min(self.max_ms)
    }

    /// Delay without jitter.
    pub fn nominal(&self, attempt: u32) -> u64 {
        self.without_jitter().delay(attempt, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(1_000, 30_000).without_jitter();
        let delays: Vec<_> = (0..7).map(|n| backoff.delay(n, 0.5)).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn jitter_stays_below_one_step() {
        let backoff = Backoff::new(1_000, 30_000);
        assert_eq!(backoff.delay(0, 0.0), 1_000);
        assert_eq!(backoff.delay(0, 0.5), 1_500);
        assert!(backoff.delay(0, 1.0) < 2_000);
        assert_eq!(backoff.delay(0, f64::NAN), 1_000);
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::new(1_000, 30_000);
        assert_eq!(backoff.delay(200, 0.9), 30_000);
        assert_eq!(backoff.nominal(u32::MAX), 30_000);
    }

    #[test]
    fn max_never_below_base() {
        let backoff = Backoff::new(5_000, 100);
        assert_eq!(backoff.delay(0, 0.0), 5_000);
    }

    proptest! {
        #[test]
        fn delays_never_decrease(
            base in 1u64..10_000,
            cap in 1u64..600_000,
            attempt in 0u32..80,
            j1 in 0.0f64..1.0,
            j2 in 0.0f64..1.0,
        ) {
            let backoff = Backoff::new(base, cap);
            prop_assert!(backoff.delay(attempt, j1) <= backoff.delay(attempt + 1, j2));
        }

        #[test]
        fn delays_are_bounded(
            base in 1u64..10_000,
            cap in 1u64..600_000,
            attempt in 0u32..80,
            j in 0.0f64..1.0,
        ) {
            let backoff = Backoff::new(base, cap);
            let delay = backoff.delay(attempt, j);
            prop_assert!(delay >= base.min(backoff.max_ms));
            prop_assert!(delay <= backoff.max_ms);
        }
    }
}
