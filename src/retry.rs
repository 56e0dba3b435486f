//! Bounded retry with exponential backoff.
//!
//! Used by the code generator's internal sub-retries and by callback
//! delivery. Neither consumes session iterations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and base delay.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Policy that never waits; for tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-indexed).
    ///
    /// ```rust
    /// use codeloop::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(5, 500);
    /// assert_eq!(policy.backoff(1), Duration::from_millis(500));
    /// assert_eq!(policy.backoff(2), Duration::from_millis(1000));
    /// assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    /// ```
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = BACKOFF_MULTIPLIER.saturating_pow(exponent);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts_made`.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
