//! Manually advanced clock for deterministic tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use veranda_core::{ClockEffects, Timestamp};

/// Clock whose time only moves when the test says so.
///
/// `sleep_ms` never waits on real time. It records the requested delay and
/// yields once, so retry loops driven by the clock make progress as fast as
/// the test scheduler lets them.
#[derive(Debug, Clone, Default)]
pub struct TestClock {
    now_ms: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<u64>>>,
}

impl TestClock {
    /// Clock starting at the epoch.
    pub fn new() -> Self {
        Self::at(0)
    }

    /// Clock starting at `millis` past the epoch.
    pub fn at(millis: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(millis)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jumps the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        self.now_ms.store(millis, Ordering::SeqCst);
    }

    /// Every delay that `sleep_ms` has been asked for, in call order.
    ///
    /// Lets tests assert on backoff schedules without waiting them out.
    pub fn recorded_sleeps(&self) -> Vec<u64> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl ClockEffects for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    async fn sleep_ms(&self, ms: u64) {
        self.sleeps.lock().push(ms);
        tokio::task::yield_now().await;
    }
}
