//! Backoff between connection establishment attempts.
//!
//! The delay grows linearly with the number of failed attempts and is
//! multiplied by a random jitter so that callers retrying at the same time
//! spread out against a recovering backend. It never exceeds the configured
//! cap.

use std::time::Duration;

use rand::Rng;

use crate::config::PoolSettings;

/// Lower bound of the per-attempt jitter (inclusive).
pub const MIN_RETRY_JITTER: Duration = Duration::from_millis(300);

/// Upper bound of the per-attempt jitter (exclusive).
pub const MAX_RETRY_JITTER: Duration = Duration::from_millis(3000);

/// Retry policy for connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Cap on a single delay.
    pub max_delay: Duration,
}

impl RetryBackoff {
    /// Build the policy described by pool settings.
    #[must_use]
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_attempts: settings.max_failed_connection_attempts,
            max_delay: settings.max_connection_retry_delay,
        }
    }

    /// Check if another attempt is allowed after `failed_attempts` failures.
    #[must_use]
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Delay to wait after `failed_attempts` failures, with fresh jitter.
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let low = MIN_RETRY_JITTER.as_millis() as u64;
        let high = MAX_RETRY_JITTER.as_millis() as u64;
        let jitter_ms = rand::rng().random_range(low..high);
        self.delay_with_jitter(failed_attempts, Duration::from_millis(jitter_ms))
    }

    /// Delay to wait after `failed_attempts` failures for a given jitter.
    #[must_use]
    pub fn delay_with_jitter(&self, failed_attempts: u32, jitter: Duration) -> Duration {
        jitter
            .checked_mul(failed_attempts)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}
