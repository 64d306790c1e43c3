//! Shared harness for the end-to-end tests: a [`SyncClient`] wired to the
//! in-memory provider and a manually advanced clock.

#![allow(dead_code)]

use std::sync::Arc;

use veranda_core::{ClockEffects, ProviderEffects, UserId};
use veranda_sync::{SyncClient, SyncConfig};
use veranda_testkit::{InMemoryProvider, TestClock};

/// One engine instance and the doubles behind it.
pub struct Engine {
    pub provider: Arc<InMemoryProvider>,
    pub clock: Arc<TestClock>,
    pub client: Arc<SyncClient>,
    pub viewer: UserId,
}

impl Engine {
    /// Engine over a fresh provider, not yet signed in. Seed provider rows
    /// first so the initial resync on [`Engine::sign_in`] loads them.
    ///
    /// The clock starts at t=100000 so watermarks set "now" sit visibly
    /// above fixture timestamps.
    pub fn start() -> Self {
        veranda_testkit::init_test_logging();
        let provider = Arc::new(InMemoryProvider::new());
        let clock = Arc::new(TestClock::at(100_000));
        let client = Arc::new(SyncClient::new(
            provider.clone() as Arc<dyn ProviderEffects>,
            clock.clone() as Arc<dyn ClockEffects>,
            SyncConfig::for_testing(),
        ));
        Self {
            provider,
            clock,
            client,
            viewer: UserId::new(),
        }
    }

    /// Sign the viewer in and wait for the session scopes to finish their
    /// initial resync.
    pub async fn sign_in(&self) {
        self.client.sign_in(self.viewer).await.expect("sign in");
        settle().await;
    }
}

/// Let the spawned channel, dispatch, and reconciler tasks drain.
pub async fn settle() {
    for _ in 0..40 {
        tokio::task::yield_now().await;
    }
}
