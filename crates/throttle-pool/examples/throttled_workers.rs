//! Throttled pool under concurrent load.
//!
//! This example drives a pool of simulated sessions from many worker tasks.
//! Sessions fail to open at a configurable rate and occasionally drop while
//! in use, so the run exercises warm-up, reuse, retry with backoff, and
//! disposal of broken connections.
//!
//! # Running
//!
//! ```bash
//! export THROTTLE_WORKERS=50
//! export THROTTLE_WARM_UP=10
//! export THROTTLE_FAILURE_RATE=0.2
//!
//! RUST_LOG=debug cargo run --example throttled_workers
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use throttle_pool::{CancellationToken, Connection, Pool, PoolError, PoolSettings};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("session {0} refused by server")]
    Refused(u64),
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A stand-in for a remote file-transfer session.
struct SimulatedSession {
    id: u64,
    connected: bool,
    failure_rate: f64,
}

impl SimulatedSession {
    fn new(failure_rate: f64) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connected: false,
            failure_rate,
        }
    }

    async fn write_file(&mut self, name: &str, content: &str) {
        let delay = rand::rng().random_range(5..25);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        // Some sessions are dropped by the server mid-transfer.
        let dropped = rand::rng().random_bool(0.05);
        if dropped {
            self.connected = false;
        }
        tracing::debug!(
            session = self.id,
            file = name,
            bytes = content.len(),
            "file written"
        );
    }
}

#[async_trait::async_trait]
impl Connection for SimulatedSession {
    type Error = SessionError;

    fn is_open(&self) -> bool {
        self.connected
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        if self.connected {
            return Ok(());
        }
        let delay = rand::rng().random_range(10..50);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let refused = rand::rng().random_bool(self.failure_rate);
        if refused {
            return Err(SessionError::Refused(self.id));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.connected = false;
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn random_text(len: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

async fn work(pool: Pool<SimulatedSession>, worker: usize) -> Result<(), PoolError> {
    let cancel = CancellationToken::new();
    let jitter = rand::rng().random_range(0..100);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let mut session = pool.acquire(&cancel).await?;
    let name = format!("{}_{worker}.txt", unix_millis());
    session.write_file(&name, &random_text(100)).await;
    pool.release(session).await
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let workers: usize = env_or("THROTTLE_WORKERS", 50);
    let warm_up: usize = env_or("THROTTLE_WARM_UP", 10);
    let failure_rate: f64 = env_or("THROTTLE_FAILURE_RATE", 0.2);

    println!("=== Throttled Connection Pool Example ===\n");

    let settings = PoolSettings::new()
        .max_pool_size(2)
        .max_concurrent_connections(1)
        .max_failed_connection_attempts(5)
        .max_connection_retry_delay(Duration::from_secs(2));

    println!("Pool settings:");
    println!("  Max pool size: {}", settings.max_pool_size);
    println!("  Max concurrent connections: {}", settings.max_concurrent_connections);
    println!("  Max failed attempts: {}", settings.max_failed_connection_attempts);
    println!("  Open failure rate: {:.0}%", failure_rate * 100.0);
    println!();

    let pool = Pool::new(settings, move || Ok(SimulatedSession::new(failure_rate)))?;

    // 1. Warm-up (capped at max pool size, never fails)
    println!("1. Warming up to {warm_up} connections:");
    let outcome = pool.warm_up(warm_up, &CancellationToken::new()).await?;
    println!("  {outcome:?}, idle = {}", pool.idle_count());

    // 2. Concurrent workers
    println!("\n2. Running {workers} workers:");
    let start = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|i| tokio::spawn(work(pool.clone(), i)))
        .collect();

    let mut completed = 0;
    let mut failed = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => completed += 1,
            Err(e) => {
                failed += 1;
                println!("  worker failed: {e}");
            }
        }
    }
    println!("  {completed} completed, {failed} failed in {:?}", start.elapsed());

    // 3. Final report
    println!("\n3. Pool report:");
    let metrics = pool.metrics();
    println!("  Current pool size: {}", pool.idle_count());
    println!("  Connections reused: {}", pool.connections_reused());
    println!("  Connections disposed: {}", pool.connections_disposed());
    println!("  Connections created: {}", metrics.connections_created);
    println!("  Failed attempts: {}", metrics.failed_attempts);
    println!("  Reuse ratio: {:.2}", metrics.reuse_ratio());

    pool.close().await;
    println!("\nPool closed.");

    Ok(())
}
