//! Deterministic test doubles for the Veranda sync engine.
//!
//! Everything here stands in for the managed backend and the system clock
//! so engine tests run without sockets or timers:
//!
//! - [`InMemoryProvider`]: rows, subscriptions, write echoes, and backend
//!   counter triggers, with scriptable failures and write holds,
//! - [`TestClock`]: manually advanced time whose sleeps yield instead of
//!   waiting,
//! - [`fixtures`]: row and event builders for chats, messages,
//!   notifications, and posts.
//!
//! Test-only crate; never ships.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod fixtures;
pub mod provider;

pub use clock::TestClock;
pub use provider::InMemoryProvider;

/// Installs a fmt subscriber once per process so failing tests print their
/// trace output. Safe to call from every test.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
