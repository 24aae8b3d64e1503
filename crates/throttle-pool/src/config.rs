//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Default number of idle connections retained.
pub const DEFAULT_MAX_POOL_SIZE: usize = 4;

/// Default number of simultaneous establishment attempts.
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 1;

/// Default number of attempts before establishment gives up.
pub const DEFAULT_MAX_FAILED_CONNECTION_ATTEMPTS: u32 = 5;

/// Default cap on the delay between establishment attempts.
pub const DEFAULT_MAX_CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(180);

/// Settings for a throttled connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
///
/// Settings are validated when the pool is built; invalid values are
/// rejected, never clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolSettings {
    /// Maximum number of idle connections kept for reuse.
    pub max_pool_size: usize,

    /// Maximum number of connection establishments running at once.
    ///
    /// This bounds the slow path (creation and warm-up), not the number of
    /// connections callers may hold.
    pub max_concurrent_connections: usize,

    /// Number of failed attempts after which establishment gives up.
    pub max_failed_connection_attempts: u32,

    /// Upper bound for the randomized delay between attempts.
    pub max_connection_retry_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            max_failed_connection_attempts: DEFAULT_MAX_FAILED_CONNECTION_ATTEMPTS,
            max_connection_retry_delay: DEFAULT_MAX_CONNECTION_RETRY_DELAY,
        }
    }
}

impl PoolSettings {
    /// Create pool settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of idle connections.
    #[must_use]
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the maximum number of concurrent establishment attempts.
    #[must_use]
    pub fn max_concurrent_connections(mut self, count: usize) -> Self {
        self.max_concurrent_connections = count;
        self
    }

    /// Set the number of attempts before establishment gives up.
    #[must_use]
    pub fn max_failed_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_connection_attempts = attempts;
        self
    }

    /// Set the cap on the delay between establishment attempts.
    #[must_use]
    pub fn max_connection_retry_delay(mut self, delay: Duration) -> Self {
        self.max_connection_retry_delay = delay;
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_pool_size == 0 {
            return Err(PoolError::Configuration(
                "max_pool_size must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_connections == 0 {
            return Err(PoolError::Configuration(
                "max_concurrent_connections must be greater than 0".into(),
            ));
        }
        if self.max_failed_connection_attempts == 0 {
            return Err(PoolError::Configuration(
                "max_failed_connection_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
