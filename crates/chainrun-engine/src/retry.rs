//! Retry policy with exponential backoff.

use std::time::Duration;

use chainrun_core::ProcessingOptions;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How often and how patiently a failed task attempt is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    pub max_delay: Duration,

    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&ProcessingOptions::default())
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: MAX_BACKOFF,
            jitter: false,
        }
    }

    /// Policy derived from a run's processing options.
    pub fn from_options(options: &ProcessingOptions) -> Self {
        Self {
            max_attempts: options.max_attempts().max(1),
            base_delay: options.retry_delay,
            max_delay: MAX_BACKOFF,
            jitter: true,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before `attempt` (1-based; attempt 1 never waits).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let factor = 0.25 * rand::random::<f64>();
            delay + delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
