//! # throttle-testing
//!
//! Test infrastructure for throttle-pool development.
//!
//! This crate provides scripted connections and factories for exercising
//! the pool without a network, and hosts the pool's behaviour tests.
//!
//! ## Features
//!
//! - Mock connections that record their lifecycle transitions
//! - Handles for breaking a connection while the pool owns it
//! - Scripted factories (factory errors, refused opens, hanging opens)
//! - A gauge for observing how many opens run at once
//!
//! ## Example
//!
//! ```rust,ignore
//! use throttle_pool::{CancellationToken, Pool};
//! use throttle_testing::{ScriptedFactory, Step, fast_settings};
//!
//! #[tokio::test]
//! async fn test_retries_until_open() {
//!     let factory = ScriptedFactory::sequence([Step::REFUSED, Step::REFUSED], Step::OPENS);
//!     let pool = Pool::new(fast_settings(), factory.clone()).unwrap();
//!
//!     let conn = pool.acquire(&CancellationToken::new()).await.unwrap();
//!     assert_eq!(conn.id(), 3);
//!     assert_eq!(factory.calls(), 3);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock;

pub use fixtures::{ScriptedFactory, Step, fast_settings, init_tracing};
pub use mock::{Gauge, MockConnection, MockError, MockHandle, OpenBehavior, OpenHook};
