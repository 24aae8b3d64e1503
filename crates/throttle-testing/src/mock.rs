//! Mock connections for pool tests.
//!
//! A [`MockConnection`] is moved into and out of the pool like any real
//! connection. Its [`MockHandle`] stays with the test, so the test can
//! inspect the connection's history or break it while the pool owns it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use throttle_pool::{Connection, ConnectionState};
use thiserror::Error;

/// Errors produced by mock connections and factories.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// The factory itself refused to produce a connection.
    #[error("factory call {call} failed")]
    FactoryFailed {
        /// 1-based factory call number.
        call: usize,
    },

    /// Opening the connection failed.
    #[error("connection {id} refused")]
    OpenRefused {
        /// Connection id.
        id: u64,
    },

    /// Closing the connection failed.
    #[error("connection {id} failed to close")]
    CloseFailed {
        /// Connection id.
        id: u64,
    },
}

/// How a mock connection reacts to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open immediately.
    Succeed,
    /// Open after sleeping.
    SucceedAfter(Duration),
    /// Fail immediately.
    Fail,
    /// Never complete.
    Hang,
}

/// Work run inside `open` right after the connection reaches `Open`.
///
/// A hook whose future never suspends runs in the same poll that completes
/// the open, so its effects are visible before the pool sees the success.
pub struct OpenHook(HookFn);

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HookFn = Box<dyn FnOnce() -> HookFuture + Send>;

impl OpenHook {
    /// Wrap a closure producing the hook's future.
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || -> HookFuture { Box::pin(hook()) }))
    }
}

impl fmt::Debug for OpenHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpenHook")
    }
}

/// Tracks how many connections are opening at the same time.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    /// Highest value observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Current value.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Shared {
    id: u64,
    history: Mutex<Vec<ConnectionState>>,
    illegal_transitions: AtomicUsize,
    healthy: AtomicBool,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(ConnectionState::Created)
    }

    fn transition(&self, next: ConnectionState) {
        let mut history = self.history.lock();
        let current = history.last().copied().unwrap_or(ConnectionState::Created);
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            self.illegal_transitions.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(id = self.id, from = ?current, to = ?next, "illegal transition");
        }
        history.push(next);
    }
}

/// Test-side view of a [`MockConnection`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockHandle {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Every state the connection went through, starting with `Created`.
    #[must_use]
    pub fn history(&self) -> Vec<ConnectionState> {
        self.shared.history.lock().clone()
    }

    /// Number of transitions the lifecycle state machine does not allow.
    #[must_use]
    pub fn illegal_transitions(&self) -> usize {
        self.shared.illegal_transitions.load(Ordering::SeqCst)
    }

    /// Simulate the server dropping (or restoring) the session.
    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Times `open` was called.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.shared.open_calls.load(Ordering::SeqCst)
    }

    /// Times `close` was called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Times `release_resources` was called.
    #[must_use]
    pub fn release_calls(&self) -> usize {
        self.shared.release_calls.load(Ordering::SeqCst)
    }
}

/// A scripted connection.
#[derive(Debug)]
pub struct MockConnection {
    shared: Arc<Shared>,
    open_behavior: OpenBehavior,
    close_fails: bool,
    gauge: Option<Arc<Gauge>>,
    on_opened: Option<OpenHook>,
}

impl MockConnection {
    /// Create an unopened connection.
    #[must_use]
    pub fn new(id: u64, open_behavior: OpenBehavior) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                history: Mutex::new(vec![ConnectionState::Created]),
                illegal_transitions: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
                open_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                release_calls: AtomicUsize::new(0),
            }),
            open_behavior,
            close_fails: false,
            gauge: None,
            on_opened: None,
        }
    }

    /// Make `close` report an error (the session is still torn down).
    #[must_use]
    pub fn with_failing_close(mut self) -> Self {
        self.close_fails = true;
        self
    }

    /// Record concurrent opens in `gauge`.
    #[must_use]
    pub fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Run `hook` once, inside the first successful `open`.
    #[must_use]
    pub fn with_open_hook(mut self, hook: OpenHook) -> Self {
        self.on_opened = Some(hook);
        self
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Get a handle that outlives ownership transfers.
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct GaugeGuard<'a>(Option<&'a Gauge>);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        if let Some(gauge) = self.0 {
            gauge.exit();
        }
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    type Error = MockError;

    fn is_open(&self) -> bool {
        // The pool never tells a connection it went idle, so a pooled mock
        // stays in `Open`.
        self.shared.state() == ConnectionState::Open
            && self.shared.healthy.load(Ordering::SeqCst)
    }

    async fn open(&mut self) -> Result<(), MockError> {
        if self.is_open() {
            return Ok(());
        }
        self.shared.open_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.transition(ConnectionState::Opening);

        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        // Dropped on every exit, including when the pool cancels the open.
        let _guard = GaugeGuard(self.gauge.as_deref());

        match self.open_behavior {
            OpenBehavior::Succeed => {}
            OpenBehavior::SucceedAfter(delay) => tokio::time::sleep(delay).await,
            OpenBehavior::Fail => return Err(MockError::OpenRefused { id: self.shared.id }),
            OpenBehavior::Hang => std::future::pending::<()>().await,
        }

        self.shared.transition(ConnectionState::Open);
        if let Some(hook) = self.on_opened.take() {
            (hook.0)().await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MockError> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.shared.transition(ConnectionState::Closing);
        self.shared.transition(ConnectionState::Closed);
        if self.close_fails {
            return Err(MockError::CloseFailed { id: self.shared.id });
        }
        Ok(())
    }

    fn release_resources(&mut self) {
        self.shared.release_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_close_follow_lifecycle() {
        let mut conn = MockConnection::new(1, OpenBehavior::Succeed);
        let handle = conn.handle();

        assert!(!conn.is_open());
        conn.open().await.unwrap();
        assert!(conn.is_open());
        conn.close().await.unwrap();
        assert!(!conn.is_open());

        assert_eq!(
            handle.history(),
            vec![
                ConnectionState::Created,
                ConnectionState::Opening,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Closed,
            ]
        );
        assert_eq!(handle.illegal_transitions(), 0);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let mut conn = MockConnection::new(1, OpenBehavior::Succeed);
        conn.open().await.unwrap();
        conn.open().await.unwrap();
        assert_eq!(conn.handle().open_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_twice_is_safe() {
        let mut conn = MockConnection::new(1, OpenBehavior::Succeed);
        conn.open().await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.handle().state(), ConnectionState::Closed);
        assert_eq!(conn.handle().illegal_transitions(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_reports_refusal() {
        let mut conn = MockConnection::new(7, OpenBehavior::Fail);
        let err = conn.open().await.unwrap_err();
        assert_eq!(err, MockError::OpenRefused { id: 7 });
        assert_eq!(conn.handle().state(), ConnectionState::Opening);
    }

    #[tokio::test]
    async fn test_pooled_round_trip_stays_out_of_idle() {
        use throttle_pool::{CancellationToken, Pool};

        let factory = crate::ScriptedFactory::always(crate::Step::OPENS);
        let pool = Pool::<MockConnection>::new(crate::fast_settings(), factory).unwrap();
        let cancel = CancellationToken::new();

        pool.warm_up(1, &cancel).await.unwrap();
        let conn = pool.acquire(&cancel).await.unwrap();
        let handle = conn.handle();
        assert!(conn.is_open());
        pool.release(conn).await.unwrap();
        pool.close().await;

        assert_eq!(
            handle.history(),
            vec![
                ConnectionState::Created,
                ConnectionState::Opening,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_open_hook_runs_before_open_returns() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut conn = MockConnection::new(1, OpenBehavior::Succeed).with_open_hook(OpenHook::new(
            move || async move {
                flag.store(true, Ordering::SeqCst);
            },
        ));

        conn.open().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_not_open() {
        let mut conn = MockConnection::new(1, OpenBehavior::Succeed);
        conn.open().await.unwrap();
        conn.handle().set_healthy(false);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_gauge_tracks_concurrent_opens() {
        let gauge = Arc::new(Gauge::default());
        let mut a = MockConnection::new(1, OpenBehavior::SucceedAfter(Duration::from_millis(20)))
            .with_gauge(Arc::clone(&gauge));
        let mut b = MockConnection::new(2, OpenBehavior::SucceedAfter(Duration::from_millis(20)))
            .with_gauge(Arc::clone(&gauge));

        let (ra, rb) = tokio::join!(a.open(), b.open());
        ra.unwrap();
        rb.unwrap();

        assert_eq!(gauge.peak(), 2);
        assert_eq!(gauge.current(), 0);
    }
}
