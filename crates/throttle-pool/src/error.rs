//! Pool error types.

use thiserror::Error;

/// Boxed error carried from a connection's own error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// An argument passed to a pool operation was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The caller's cancellation token fired while the operation was suspended.
    #[error("operation cancelled")]
    Cancelled,

    /// Every establishment attempt failed.
    #[error("connection could not be established after {attempts} attempts: {source}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: BoxError,
    },

    /// Closing a released connection failed.
    #[error("failed to close connection: {0}")]
    Close(#[source] BoxError),
}

impl PoolError {
    /// Check if this error was caused by how the pool was called rather than
    /// by the connections it manages.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidArgument(_) | Self::PoolClosed
        )
    }

    /// Check if this error reports exhausted connection establishment.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_exhausted_keeps_last_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = PoolError::Exhausted {
            attempts: 3,
            source: Box::new(cause),
        };

        assert!(err.is_exhausted());
        assert!(!err.is_caller_error());
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(err.source().unwrap().to_string(), "refused");
    }

    #[test]
    fn test_caller_errors() {
        assert!(PoolError::PoolClosed.is_caller_error());
        assert!(PoolError::InvalidArgument("target".into()).is_caller_error());
        assert!(PoolError::Configuration("max_pool_size".into()).is_caller_error());
        assert!(!PoolError::Cancelled.is_caller_error());
    }
}
