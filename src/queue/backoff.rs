//! Retry policy for queued mutations.

use crate::config::QueueConfig;
use std::time::Duration;

/// Exponential backoff with a retry ceiling.
///
/// `delay = base * 2^min(retry_count, max_exponent)`; an operation whose
/// retry count reaches `max_retries` is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_retries: u32,
    pub max_exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_backoff_secs),
            max_retries: config.max_retries,
            max_exponent: config.max_backoff_exponent,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `retry_count` failures.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(self.max_exponent).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Whether an operation with `retry_count` failures should be dropped.
    #[must_use]
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
