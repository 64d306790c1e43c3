//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Reconnect behavior for one event channel.
///
/// Retries are unlimited while the scope is wanted; there is deliberately
/// no attempt cap. The delay grows geometrically from `base_delay_ms` and
/// is clamped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Geometric growth factor between consecutive retries.
    pub backoff_multiplier: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Reconnect behavior shared by every event channel.
    pub channel: ChannelConfig,
    /// Feed page size for pagination and feed resync reads.
    pub feed_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            feed_page_size: 20,
        }
    }
}

impl SyncConfig {
    /// Configuration tuned for tests: near-instant retries, small pages.
    pub fn for_testing() -> Self {
        Self {
            channel: ChannelConfig {
                base_delay_ms: 1,
                max_delay_ms: 10,
                backoff_multiplier: 2.0,
            },
            feed_page_size: 3,
        }
    }
}
