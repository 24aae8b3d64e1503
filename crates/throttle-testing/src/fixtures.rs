//! Test fixture utilities.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use throttle_pool::{ConnectionFactory, PoolSettings};

use crate::mock::{Gauge, MockConnection, MockError, MockHandle, OpenBehavior, OpenHook};

/// What the factory does on one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The factory call itself fails.
    FactoryError,
    /// Produce a connection whose `open` behaves as given.
    Connect(OpenBehavior),
}

impl Step {
    /// Produce a connection that opens immediately.
    pub const OPENS: Step = Step::Connect(OpenBehavior::Succeed);
    /// Produce a connection whose open fails.
    pub const REFUSED: Step = Step::Connect(OpenBehavior::Fail);
    /// Produce a connection whose open never completes.
    pub const HANGS: Step = Step::Connect(OpenBehavior::Hang);
}

#[derive(Debug)]
struct FactoryInner {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    handles: Mutex<Vec<MockHandle>>,
    failing_close: AtomicBool,
    gauge: Arc<Gauge>,
    next_open_hook: Mutex<Option<OpenHook>>,
}

/// A connection factory that follows a script.
///
/// Steps are consumed in order; once the script runs out every call uses
/// the fallback step. Clones share the same script and counters, so a test
/// can hand one clone to the pool and inspect another.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    inner: Arc<FactoryInner>,
}

impl ScriptedFactory {
    /// A factory that always does the same thing.
    #[must_use]
    pub fn always(step: Step) -> Self {
        Self::sequence([], step)
    }

    /// A factory that plays `steps`, then repeats `then`.
    #[must_use]
    pub fn sequence(steps: impl IntoIterator<Item = Step>, then: Step) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                script: Mutex::new(steps.into_iter().collect()),
                fallback: then,
                calls: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
                failing_close: AtomicBool::new(false),
                gauge: Arc::new(Gauge::default()),
                next_open_hook: Mutex::new(None),
            }),
        }
    }

    /// Make every connection produced from now on fail to close.
    #[must_use]
    pub fn with_failing_close(self) -> Self {
        self.inner.failing_close.store(true, Ordering::SeqCst);
        self
    }

    /// Attach `hook` to the next connection produced.
    pub fn on_next_open(&self, hook: OpenHook) {
        *self.inner.next_open_hook.lock() = Some(hook);
    }

    /// Number of times the factory was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Handles for every connection produced, in creation order.
    #[must_use]
    pub fn handles(&self) -> Vec<MockHandle> {
        self.inner.handles.lock().clone()
    }

    /// Concurrency gauge shared by every connection produced.
    #[must_use]
    pub fn open_gauge(&self) -> Arc<Gauge> {
        Arc::clone(&self.inner.gauge)
    }
}

impl ConnectionFactory<MockConnection> for ScriptedFactory {
    fn create(&self) -> Result<MockConnection, MockError> {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or(self.inner.fallback);

        let behavior = match step {
            Step::FactoryError => return Err(MockError::FactoryFailed { call }),
            Step::Connect(behavior) => behavior,
        };

        let mut conn = MockConnection::new(call as u64, behavior)
            .with_gauge(Arc::clone(&self.inner.gauge));
        if self.inner.failing_close.load(Ordering::SeqCst) {
            conn = conn.with_failing_close();
        }
        if let Some(hook) = self.inner.next_open_hook.lock().take() {
            conn = conn.with_open_hook(hook);
        }
        self.inner.handles.lock().push(conn.handle());
        Ok(conn)
    }
}

/// Pool settings that never sleep between attempts.
#[must_use]
pub fn fast_settings() -> PoolSettings {
    PoolSettings::new()
        .max_pool_size(2)
        .max_concurrent_connections(1)
        .max_failed_connection_attempts(3)
        .max_connection_retry_delay(Duration::ZERO)
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output is captured by the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use throttle_pool::ConnectionState;

    #[test]
    fn test_script_then_fallback() {
        let factory = ScriptedFactory::sequence([Step::FactoryError, Step::REFUSED], Step::OPENS);

        assert_eq!(
            factory.create().unwrap_err(),
            MockError::FactoryFailed { call: 1 }
        );
        assert!(factory.create().is_ok());
        assert!(factory.create().is_ok());
        assert_eq!(factory.calls(), 3);
        assert_eq!(factory.handles().len(), 2);
    }

    #[test]
    fn test_clones_share_counters() {
        let factory = ScriptedFactory::always(Step::OPENS);
        let other = factory.clone();
        let conn = other.create().unwrap();

        assert_eq!(factory.calls(), 1);
        assert_eq!(factory.handles()[0].id(), conn.id());
        assert_eq!(factory.handles()[0].state(), ConnectionState::Created);
    }

    #[test]
    fn test_fast_settings_are_valid() {
        assert!(fast_settings().validate().is_ok());
    }
}
