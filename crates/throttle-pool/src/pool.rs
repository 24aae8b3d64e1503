//! Connection pool implementation.
//!
//! Idle connections wait in a lock-free FIFO queue and are handed out
//! without any serialization. Only the slow path (creating a connection or
//! warming the pool up) passes through a counting gate sized by
//! `max_concurrent_connections`, so a recovering backend never sees more
//! simultaneous connection attempts than configured.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::config::PoolSettings;
use crate::error::{BoxError, PoolError, Result};
use crate::lifecycle::{Connection, ConnectionFactory};
use crate::retry::RetryBackoff;

/// A throttled pool of connections.
///
/// The handle is cheap to clone; all clones share the same idle queue,
/// gate and counters.
///
/// # Example
///
/// ```rust,ignore
/// use throttle_pool::Pool;
/// use tokio_util::sync::CancellationToken;
///
/// let pool = Pool::builder()
///     .max_pool_size(2)
///     .max_concurrent_connections(1)
///     .build(|| Ok(SessionConnection::new(addr)))?;
///
/// let cancel = CancellationToken::new();
/// pool.warm_up(2, &cancel).await?;
///
/// let conn = pool.acquire(&cancel).await?;
/// // Use connection...
/// pool.release(conn).await?;
///
/// pool.close().await;
/// ```
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C: Connection> {
    settings: PoolSettings,
    backoff: RetryBackoff,
    factory: Box<dyn ConnectionFactory<C>>,

    /// Live connections nobody owns right now.
    idle: SegQueue<C>,

    /// Bounds concurrent establishment and warm-up.
    gate: Semaphore,

    closed: AtomicBool,

    /// Cancelled by `close()` to wake suspended callers.
    shutdown: CancellationToken,

    created_at: Instant,
    counters: PoolCounters,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    disposed: AtomicU64,
    stale_discarded: AtomicU64,
    failed_attempts: AtomicU64,
    exhausted: AtomicU64,
}

/// Result of a single establishment attempt.
enum Attempt<C> {
    Opened(C),
    Failed(BoxError),
    Interrupted(PoolError),
}

/// Advisory result of [`Pool::warm_up`].
///
/// Warm-up never fails because of the connections it tries to create;
/// failures are logged and reported here instead.
#[derive(Debug)]
#[non_exhaustive]
pub enum WarmUpOutcome {
    /// The idle queue already held enough connections.
    AlreadyWarm {
        /// Idle connections found.
        idle: usize,
    },
    /// Every missing connection was created.
    Completed {
        /// Connections added to the idle queue.
        created: usize,
    },
    /// Warm-up stopped early.
    Interrupted {
        /// Connections added before stopping.
        created: usize,
        /// Why it stopped.
        error: PoolError,
    },
}

impl WarmUpOutcome {
    /// Number of connections this warm-up added to the pool.
    #[must_use]
    pub fn created(&self) -> usize {
        match self {
            Self::AlreadyWarm { .. } => 0,
            Self::Completed { created } | Self::Interrupted { created, .. } => *created,
        }
    }

    /// Check if warm-up stopped before reaching its target.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

impl<C: Connection> Pool<C> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder<C> {
        PoolBuilder::new()
    }

    /// Create a new pool with the given settings and connection factory.
    ///
    /// Fails with [`PoolError::Configuration`] if the settings are invalid.
    pub fn new<F>(settings: PoolSettings, factory: F) -> Result<Self>
    where
        F: ConnectionFactory<C> + 'static,
    {
        settings.validate()?;

        let inner = Arc::new(PoolInner {
            backoff: RetryBackoff::from_settings(&settings),
            factory: Box::new(factory),
            idle: SegQueue::new(),
            gate: Semaphore::new(settings.max_concurrent_connections),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            created_at: Instant::now(),
            counters: PoolCounters::default(),
            settings,
        });

        tracing::info!(
            max_pool_size = inner.settings.max_pool_size,
            max_concurrent_connections = inner.settings.max_concurrent_connections,
            max_failed_connection_attempts = inner.settings.max_failed_connection_attempts,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// A healthy idle connection is returned without waiting on the gate.
    /// Otherwise the caller waits for a gate permit, checks the idle queue
    /// once more, and establishes a new connection if it is still empty.
    ///
    /// Returns [`PoolError::Exhausted`] when every establishment attempt
    /// fails and [`PoolError::Cancelled`] if `cancel` fires while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<C> {
        self.ensure_open()?;

        if let Some(conn) = self.take_idle().await {
            return Ok(conn);
        }

        let _permit = self.enter_gate(cancel).await?;

        // Another caller may have released a connection while we waited.
        if let Some(conn) = self.take_idle().await {
            return Ok(conn);
        }

        self.establish(cancel).await
    }

    /// Pre-populate the idle queue up to `target` connections.
    ///
    /// The target is capped at `max_pool_size`. Connections are created one
    /// at a time under a single gate permit. Only caller errors (a zero
    /// target, a pool that is already closed) are returned as `Err`.
    /// Establishment failures, cancellation, and the pool closing midway end
    /// the warm-up early and are reported in the returned [`WarmUpOutcome`].
    pub async fn warm_up(
        &self,
        target: usize,
        cancel: &CancellationToken,
    ) -> Result<WarmUpOutcome> {
        if target == 0 {
            return Err(PoolError::InvalidArgument(
                "warm-up target must be greater than 0".into(),
            ));
        }
        self.ensure_open()?;

        let idle = self.idle_count();
        if idle >= target {
            return Ok(WarmUpOutcome::AlreadyWarm { idle });
        }

        let _permit = match self.enter_gate(cancel).await {
            Ok(permit) => permit,
            Err(error) => return Ok(self.warm_up_interrupted(0, target, error)),
        };

        // Re-check under the gate, and again before every creation, so
        // concurrent warm-ups do not overshoot the target.
        let target_idle = target.min(self.inner.settings.max_pool_size);
        let idle = self.idle_count();
        if idle >= target_idle {
            return Ok(WarmUpOutcome::AlreadyWarm { idle });
        }

        let mut created = 0;
        while created < target_idle && self.idle_count() < target_idle {
            let conn = match self.establish(cancel).await {
                Ok(conn) => conn,
                Err(error) => return Ok(self.warm_up_interrupted(created, target, error)),
            };
            let pooled = self.enqueue_idle(conn).await;
            created += 1;
            if !pooled {
                return Ok(self.warm_up_interrupted(created, target, PoolError::PoolClosed));
            }
        }

        tracing::info!(created, idle = self.idle_count(), "connection pool warmed up");
        Ok(WarmUpOutcome::Completed { created })
    }

    /// Return a connection to the pool.
    ///
    /// The connection is queued for reuse if the pool has room and the
    /// connection is still open. Otherwise it is closed and counted as
    /// disposed; a close failure is returned as [`PoolError::Close`].
    ///
    /// The room check and the enqueue are not atomic, so concurrent releases
    /// can push the idle queue slightly past `max_pool_size`.
    pub async fn release(&self, mut conn: C) -> Result<()> {
        if self.is_closed() {
            discard(conn).await;
            return Err(PoolError::PoolClosed);
        }

        if self.idle_count() < self.inner.settings.max_pool_size && conn.is_open() {
            if !self.enqueue_idle(conn).await {
                return Err(PoolError::PoolClosed);
            }
            tracing::trace!(idle = self.idle_count(), "connection returned to pool");
            return Ok(());
        }

        self.inner.counters.disposed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            open = conn.is_open(),
            idle = self.idle_count(),
            "disposing released connection"
        );

        let result = conn.close().await;
        conn.release_resources();
        result.map_err(|e| PoolError::Close(Box::new(e)))
    }

    /// Close the pool, closing every idle connection.
    ///
    /// Idempotent. A failure closing one connection is logged and does not
    /// stop the others from being closed. Callers suspended in
    /// [`acquire`](Self::acquire) or [`warm_up`](Self::warm_up) return
    /// [`PoolError::PoolClosed`]; later calls fail the same way.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Pairs with the fence in enqueue_idle.
        atomic::fence(Ordering::SeqCst);

        self.inner.shutdown.cancel();
        self.inner.gate.close();

        let (drained, failures) = self.drain().await;
        tracing::info!(drained, failures, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of idle connections currently in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    /// Number of acquisitions served by an idle connection.
    #[must_use]
    pub fn connections_reused(&self) -> u64 {
        self.inner.counters.reused.load(Ordering::Relaxed)
    }

    /// Number of connections closed by release or by closing the pool.
    #[must_use]
    pub fn connections_disposed(&self) -> u64 {
        self.inner.counters.disposed.load(Ordering::Relaxed)
    }

    /// Get the pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            idle: self.idle_count(),
            max_pool_size: self.inner.settings.max_pool_size,
            available_permits: self.inner.gate.available_permits(),
            max_concurrent: self.inner.settings.max_concurrent_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let counters = &self.inner.counters;
        PoolMetrics {
            connections_created: counters.created.load(Ordering::Relaxed),
            connections_reused: counters.reused.load(Ordering::Relaxed),
            connections_disposed: counters.disposed.load(Ordering::Relaxed),
            stale_discarded: counters.stale_discarded.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            uptime: self.inner.created_at.elapsed(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    /// Push a live connection onto the idle queue.
    ///
    /// Returns `false` if the pool was closed around the push; the queue is
    /// drained again so the connection is closed rather than stranded.
    async fn enqueue_idle(&self, conn: C) -> bool {
        self.inner.idle.push(conn);
        // Either close() sees the push when it drains, or we see the flag.
        atomic::fence(Ordering::SeqCst);
        if self.is_closed() {
            self.drain().await;
            return false;
        }
        true
    }

    /// Dequeue one idle connection, keeping it only if it is still open.
    async fn take_idle(&self) -> Option<C> {
        let conn = self.inner.idle.pop()?;
        if conn.is_open() {
            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(idle = self.idle_count(), "reusing idle connection");
            return Some(conn);
        }

        self.inner
            .counters
            .stale_discarded
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("discarding stale idle connection");
        discard(conn).await;
        None
    }

    async fn enter_gate(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(PoolError::PoolClosed),
            permit = self.inner.gate.acquire() => permit.map_err(|_| PoolError::PoolClosed),
        }
    }

    /// Create and open a new connection, retrying with backoff.
    async fn establish(&self, cancel: &CancellationToken) -> Result<C> {
        let mut failed_attempts = 0u32;

        loop {
            let error = match self.open_one(cancel).await {
                Attempt::Opened(conn) => {
                    self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(failed_attempts, "connection established");
                    return Ok(conn);
                }
                // Cancellation ends establishment: the half-open connection is
                // discarded but not counted in `failed_attempts`, and no retry
                // follows.
                Attempt::Interrupted(error) => return Err(error),
                Attempt::Failed(error) => error,
            };

            failed_attempts += 1;
            self.inner
                .counters
                .failed_attempts
                .fetch_add(1, Ordering::Relaxed);

            if !self.inner.backoff.should_retry(failed_attempts) {
                self.inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    attempts = failed_attempts,
                    error = %error,
                    "connection could not be established"
                );
                return Err(PoolError::Exhausted {
                    attempts: failed_attempts,
                    source: error,
                });
            }

            let delay = self.inner.backoff.delay_for(failed_attempts);
            tracing::warn!(
                attempt = failed_attempts,
                delay_ms = duration_millis(delay),
                error = %error,
                "connection attempt failed, retrying"
            );
            self.pause(delay, cancel).await?;
        }
    }

    async fn open_one(&self, cancel: &CancellationToken) -> Attempt<C> {
        let mut conn = match self.inner.factory.create() {
            Ok(conn) => conn,
            Err(e) => return Attempt::Failed(Box::new(e)),
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(PoolError::PoolClosed),
            result = conn.open() => Ok(result),
        };

        match outcome {
            Ok(Ok(())) => Attempt::Opened(conn),
            Ok(Err(e)) => {
                discard(conn).await;
                Attempt::Failed(Box::new(e))
            }
            Err(interrupt) => {
                discard(conn).await;
                Attempt::Interrupted(interrupt)
            }
        }
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(PoolError::PoolClosed),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Close every idle connection, returning `(closed, close_failures)`.
    async fn drain(&self) -> (usize, usize) {
        let mut drained = 0;
        let mut failures = 0;
        while let Some(mut conn) = self.inner.idle.pop() {
            if let Err(e) = conn.close().await {
                failures += 1;
                tracing::warn!(error = %e, "failed to close idle connection");
            }
            conn.release_resources();
            self.inner.counters.disposed.fetch_add(1, Ordering::Relaxed);
            drained += 1;
        }
        (drained, failures)
    }

    fn warm_up_interrupted(
        &self,
        created: usize,
        target: usize,
        error: PoolError,
    ) -> WarmUpOutcome {
        tracing::warn!(created, target, error = %error, "connection pool warm-up failed");
        WarmUpOutcome::Interrupted { created, error }
    }
}

fn duration_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Best-effort close of a connection nobody will use again.
async fn discard<C: Connection>(mut conn: C) {
    if let Err(e) = conn.close().await {
        tracing::trace!(error = %e, "ignoring error while discarding connection");
    }
    conn.release_resources();
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("settings", &self.inner.settings)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Drop for PoolInner<C> {
    fn drop(&mut self) {
        while let Some(mut conn) = self.idle.pop() {
            conn.release_resources();
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .max_pool_size(2)
///     .max_failed_connection_attempts(3)
///     .build(factory)?;
/// ```
pub struct PoolBuilder<C> {
    settings: PoolSettings,
    _connection: PhantomData<fn() -> C>,
}

impl<C: Connection> PoolBuilder<C> {
    /// Create a new pool builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: PoolSettings::default(),
            _connection: PhantomData,
        }
    }

    /// Replace all settings at once.
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the maximum number of idle connections.
    #[must_use]
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.settings.max_pool_size = size;
        self
    }

    /// Set the maximum number of concurrent establishment attempts.
    #[must_use]
    pub fn max_concurrent_connections(mut self, count: usize) -> Self {
        self.settings.max_concurrent_connections = count;
        self
    }

    /// Set the number of attempts before establishment gives up.
    #[must_use]
    pub fn max_failed_connection_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_failed_connection_attempts = attempts;
        self
    }

    /// Set the cap on the delay between establishment attempts.
    #[must_use]
    pub fn max_connection_retry_delay(mut self, delay: Duration) -> Self {
        self.settings.max_connection_retry_delay = delay;
        self
    }

    /// Build the pool.
    pub fn build<F>(self, factory: F) -> Result<Pool<C>>
    where
        F: ConnectionFactory<C> + 'static,
    {
        Pool::new(self.settings, factory)
    }
}

impl<C: Connection> Default for PoolBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for PoolBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("settings", &self.settings)
            .finish()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub idle: usize,
    /// Maximum idle connections retained.
    pub max_pool_size: usize,
    /// Gate permits not currently held.
    pub available_permits: usize,
    /// Total gate permits.
    pub max_concurrent: usize,
}

impl PoolStatus {
    /// Number of callers currently inside the slow path.
    #[must_use]
    pub fn establishing(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available_permits)
    }

    /// Check if the idle queue is at or above its target size.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.idle >= self.max_pool_size
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Connections successfully established.
    pub connections_created: u64,
    /// Acquisitions served from the idle queue.
    pub connections_reused: u64,
    /// Connections closed on release or on pool close.
    pub connections_disposed: u64,
    /// Idle connections found closed when dequeued.
    pub stale_discarded: u64,
    /// Failed establishment attempts, including ones later retried.
    pub failed_attempts: u64,
    /// Establishments that gave up after the last attempt.
    pub exhausted: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of handed-out connections that were reused (0.0 to 1.0).
    #[must_use]
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.connections_reused + self.connections_created;
        if total == 0 {
            return 0.0;
        }
        self.connections_reused as f64 / total as f64
    }
}
