//! Production clock.
//!
//! Delegates to system time; the manual-advance clock used by tests lives
//! in `veranda-testkit`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use veranda_core::{ClockEffects, Timestamp};

/// Stateless clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClockEffects for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        Timestamp::from_millis(millis)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_reads_unix_millis() {
        let clock = SystemClock::new();
        // 2020-01-01 in millis; any real system clock is past this.
        assert!(clock.now() > Timestamp::from_millis(1_577_836_800_000));
    }
}
