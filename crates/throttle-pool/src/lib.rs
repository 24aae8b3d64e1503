//! # throttle-pool
//!
//! Connection pool for expensive, stateful network sessions with throttled
//! connection establishment.
//!
//! The pool reuses healthy idle connections, bounds how many connections
//! may be established at the same time, and recovers from transient
//! connection failures by retrying with a randomized, capped backoff.
//! It knows nothing about the transport behind a connection; anything that
//! implements [`Connection`] can be pooled.
//!
//! ## Features
//!
//! - Lock-free idle queue with lazy health checks on acquire and release
//! - Counting gate that limits concurrent connection establishment
//! - Jittered linear backoff with a hard attempt ceiling
//! - Best-effort warm-up that never fails the caller
//! - Cancellation of every suspending operation via `CancellationToken`
//! - Reuse and disposal counters safe to read at any time
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use throttle_pool::{Pool, PoolSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! let settings = PoolSettings::new()
//!     .max_pool_size(2)
//!     .max_concurrent_connections(1)
//!     .max_failed_connection_attempts(3)
//!     .max_connection_retry_delay(Duration::from_secs(10));
//!
//! let pool = Pool::new(settings, || Ok(SessionConnection::new(addr)))?;
//! let cancel = CancellationToken::new();
//!
//! pool.warm_up(2, &cancel).await?;
//!
//! let conn = pool.acquire(&cancel).await?;
//! // Use connection...
//! pool.release(conn).await?;
//!
//! println!("reused {} connections", pool.connections_reused());
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod retry;

// Configuration
pub use config::PoolSettings;

// Error types
pub use error::{BoxError, PoolError, Result};

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, WarmUpOutcome};

// Lifecycle management
pub use lifecycle::{Connection, ConnectionFactory, ConnectionState};

// Retry policy
pub use retry::RetryBackoff;

// Re-exported so callers do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
