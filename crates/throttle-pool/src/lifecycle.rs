//! Connection lifecycle management.
//!
//! This module defines the capabilities a pooled connection must provide
//! and the factory the pool uses to create new ones. The pool is otherwise
//! independent of the transport behind a connection.

/// Capabilities the pool needs from a connection.
///
/// A connection is owned by exactly one party at a time: the pool's idle
/// queue or the caller that acquired it.
///
/// Uses `#[async_trait]` so the returned futures are `Send` and the pool can
/// be driven from spawned tasks.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    /// Error produced by `open` and `close`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Check if the connection is currently usable.
    ///
    /// Must be cheap and free of side effects; the pool calls it when a
    /// connection leaves or re-enters the idle queue.
    fn is_open(&self) -> bool;

    /// Establish the underlying session.
    ///
    /// Calling this on an already open connection is a no-op.
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Gracefully terminate the underlying session.
    ///
    /// Calling this on an already closed connection is a no-op.
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Release local handles and buffers.
    ///
    /// Safe to call more than once.
    fn release_resources(&mut self) {}
}

/// Produces new, unopened connections for the pool.
///
/// Called concurrently up to `max_concurrent_connections` times. Any
/// `Fn() -> Result<C, C::Error>` closure is a factory.
pub trait ConnectionFactory<C: Connection>: Send + Sync {
    /// Create a new connection that has not been opened yet.
    fn create(&self) -> Result<C, C::Error>;
}

impl<C, F> ConnectionFactory<C> for F
where
    C: Connection,
    F: Fn() -> Result<C, C::Error> + Send + Sync,
{
    fn create(&self) -> Result<C, C::Error> {
        self()
    }
}

/// State of a single connection as it moves through the pool.
///
/// `Created -> Opening -> Open <-> Idle -> Closing -> Closed`. A failed open
/// goes straight from `Opening` to `Closed`, and a released connection that
/// is not re-pooled goes from `Open` to `Closing`. Nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Produced by the factory, not yet opened.
    Created,
    /// Open in progress.
    Opening,
    /// Open and owned by a caller.
    Open,
    /// Open and waiting in the idle queue.
    Idle,
    /// Close in progress.
    Closing,
    /// Closed for good.
    Closed,
}

impl ConnectionState {
    /// Check if moving from this state to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Created, Opening)
                | (Created, Closing)
                | (Created, Closed)
                | (Opening, Open)
                | (Opening, Closing)
                | (Opening, Closed)
                | (Open, Idle)
                | (Open, Closing)
                | (Open, Closed)
                | (Idle, Open)
                | (Idle, Closing)
                | (Idle, Closed)
                | (Closing, Closed)
        )
    }

    /// Check if the connection can never be used again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
