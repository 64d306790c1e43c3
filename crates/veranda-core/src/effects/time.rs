//! Clock effect trait.
//!
//! Watermarks, optimistic message timestamps, and reconnect backoff all
//! read time through [`ClockEffects`] so tests can drive them
//! deterministically. The production implementation lives with the engine
//! runtime; the manual-advance test clock lives in the testkit.

use std::sync::Arc;

use async_trait::async_trait;

use crate::time::Timestamp;

/// Access to wall-clock time and timed suspension.
#[async_trait]
pub trait ClockEffects: Send + Sync {
    /// Current unix time in milliseconds.
    ///
    /// Synchronous so merge logic can stamp watermarks without suspending.
    fn now(&self) -> Timestamp;

    /// Suspend for at least `ms` milliseconds.
    async fn sleep_ms(&self, ms: u64);
}

#[async_trait]
impl<C: ClockEffects + ?Sized> ClockEffects for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }

    async fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms).await;
    }
}
