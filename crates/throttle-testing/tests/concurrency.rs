//! Concurrency Tests
//!
//! These tests hammer a shared pool from many tasks on the multi-threaded
//! runtime and check the guarantees that only show up under contention:
//! exclusive ownership, bounded connection establishment, and counters that
//! add up once every task has finished.
//!
//! Run with:
//! ```bash
//! cargo test -p throttle-testing --test concurrency
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use throttle_pool::{CancellationToken, Pool, PoolError, PoolSettings};
use throttle_testing::{MockConnection, OpenBehavior, ScriptedFactory, Step, init_tracing};
use tokio::sync::Barrier;

const SLOW_OPEN: Step = Step::Connect(OpenBehavior::SucceedAfter(Duration::from_millis(50)));

fn settings(max_pool_size: usize, max_concurrent: usize) -> PoolSettings {
    PoolSettings::new()
        .max_pool_size(max_pool_size)
        .max_concurrent_connections(max_concurrent)
        .max_failed_connection_attempts(3)
        .max_connection_retry_delay(Duration::ZERO)
}

fn pool(settings: PoolSettings, factory: &ScriptedFactory) -> Pool<MockConnection> {
    init_tracing();
    Pool::new(settings, factory.clone()).expect("valid settings")
}

// =============================================================================
// Ownership and accounting
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connections_are_never_shared() {
    const TASKS: usize = 16;
    const ROUNDS: usize = 10;

    let factory = ScriptedFactory::always(Step::Connect(OpenBehavior::SucceedAfter(
        Duration::from_millis(2),
    )));
    let pool = pool(settings(3, 2), &factory);
    let in_use = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::with_capacity(TASKS);
    for task in 0..TASKS {
        let pool = pool.clone();
        let in_use = Arc::clone(&in_use);
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for round in 0..ROUNDS {
                let conn = pool.acquire(&cancel).await.unwrap();
                let id = conn.id();
                assert!(in_use.lock().insert(id), "connection {id} handed out twice");

                tokio::task::yield_now().await;
                if (task + round) % 7 == 0 {
                    conn.handle().set_healthy(false);
                }

                in_use.lock().remove(&id);
                pool.release(conn).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let metrics = pool.metrics();
    let acquisitions = (TASKS * ROUNDS) as u64;
    assert_eq!(
        metrics.connections_created + metrics.connections_reused,
        acquisitions
    );
    // Every connection ever opened is idle, disposed, or discarded as stale.
    assert_eq!(
        metrics.connections_created,
        pool.idle_count() as u64 + metrics.connections_disposed + metrics.stale_discarded
    );
    assert_eq!(metrics.connections_created, factory.calls() as u64);
    assert!(metrics.connections_reused > 0);

    for handle in factory.handles() {
        assert_eq!(handle.illegal_transitions(), 0, "{:?}", handle.history());
    }
}

// =============================================================================
// Gate
// =============================================================================

async fn peak_opens(max_concurrent: usize, callers: usize) -> usize {
    let factory = ScriptedFactory::always(SLOW_OPEN);
    let pool = pool(settings(callers, max_concurrent), &factory);
    let barrier = Arc::new(Barrier::new(callers));

    let mut tasks = Vec::with_capacity(callers);
    for _ in 0..callers {
        let pool = pool.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            pool.acquire(&CancellationToken::new()).await.unwrap()
        }));
    }

    // Hold every connection until all callers are done so none is reused.
    let mut held = Vec::with_capacity(callers);
    for task in tasks {
        held.push(task.await.unwrap());
    }
    assert_eq!(factory.calls(), callers);
    assert_eq!(pool.connections_reused(), 0);

    for conn in held {
        pool.release(conn).await.unwrap();
    }
    factory.open_gauge().peak()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_bounds_concurrent_opens() {
    let peak = peak_opens(2, 8).await;
    assert!((1..=2).contains(&peak), "peak = {peak}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_permit_serializes_opens() {
    assert_eq!(peak_opens(1, 6).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wider_gate_allows_parallel_opens() {
    let peak = peak_opens(4, 8).await;
    assert!((2..=4).contains(&peak), "peak = {peak}");
}

// =============================================================================
// Warm-up
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_warm_ups_do_not_overshoot() {
    let factory = ScriptedFactory::always(SLOW_OPEN);
    let pool = pool(settings(4, 1), &factory);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.warm_up(3, &CancellationToken::new()).await.unwrap()
        }));
    }

    let mut created = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(!outcome.is_interrupted(), "{outcome:?}");
        created += outcome.created();
    }

    assert_eq!(created, 3);
    assert_eq!(pool.idle_count(), 3);
    assert_eq!(factory.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_during_warm_up_takes_idle_connections() {
    let factory = ScriptedFactory::always(SLOW_OPEN);
    let pool = pool(settings(4, 1), &factory);

    let warm = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.warm_up(4, &CancellationToken::new()).await })
    };

    // Waits behind the warm-up's gate permit, then finds an idle connection.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let conn = pool.acquire(&CancellationToken::new()).await.unwrap();

    let outcome = warm.await.unwrap().unwrap();
    assert_eq!(outcome.created(), 4);
    assert_eq!(pool.connections_reused(), 1);
    assert_eq!(factory.calls(), 4);

    pool.release(conn).await.unwrap();
    assert_eq!(pool.idle_count(), 4);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_under_load_leaves_nothing_open() {
    let factory = ScriptedFactory::always(Step::Connect(OpenBehavior::SucceedAfter(
        Duration::from_millis(5),
    )));
    let pool = pool(settings(2, 1), &factory);

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            loop {
                let conn = match pool.acquire(&cancel).await {
                    Ok(conn) => conn,
                    Err(PoolError::PoolClosed) => return,
                    Err(e) => panic!("unexpected error: {e}"),
                };
                tokio::time::sleep(Duration::from_millis(1)).await;
                match pool.release(conn).await {
                    Ok(()) => {}
                    Err(PoolError::PoolClosed) => return,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.close().await;
    for task in tasks {
        task.await.unwrap();
    }

    assert!(pool.is_closed());
    assert_eq!(pool.idle_count(), 0);
    for handle in factory.handles() {
        assert!(handle.state().is_terminal(), "{:?}", handle.history());
        assert_eq!(handle.illegal_transitions(), 0);
    }
}
