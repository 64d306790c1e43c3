//! Subscription channels with automatic recovery.
//!
//! An [`EventChannel`] owns one provider subscription for one scope and
//! keeps it alive: when the subscription cannot be established or its
//! event stream drops, the channel resubscribes with capped exponential
//! backoff. Every *successful* subscribe — the first included — pushes a
//! [`ChannelSignal::Resync`] ahead of the events that follow, because any
//! change emitted while the channel was down is gone for good; the
//! consumer answers a resync by re-reading the scope and bulk-replacing.
//!
//! Ordering holds per channel: signals arrive in the order produced, so a
//! resync marker always precedes the live events of the subscription that
//! triggered it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veranda_core::{ChangeEvent, ClockEffects, ProviderEffects, Scope};

use crate::config::ChannelConfig;

/// What a channel delivers to its consumer.
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    /// A live change event.
    Event(ChangeEvent),
    /// The channel (re)subscribed; re-read the scope before trusting
    /// subsequent events to be gapless.
    Resync,
}

/// A self-healing subscription for a single scope.
#[derive(Debug)]
pub(crate) struct EventChannel {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventChannel {
    /// Subscribe to `scope` and start the recovery loop.
    pub(crate) fn open(
        scope: Scope,
        provider: Arc<dyn ProviderEffects>,
        clock: Arc<dyn ClockEffects>,
        config: ChannelConfig,
        signals: mpsc::UnboundedSender<ChannelSignal>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_channel(
            scope,
            provider,
            clock,
            config,
            signals,
            shutdown_rx,
        ));
        Self { shutdown, task }
    }

    /// Stop the loop and drop the subscription.
    pub(crate) fn close(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Delay before reconnect attempt `attempt` (1-based), in milliseconds.
pub(crate) fn backoff_delay_ms(config: &ChannelConfig, attempt: u32) -> u64 {
    if attempt <= 1 {
        return config.base_delay_ms.min(config.max_delay_ms);
    }
    let factor = config.backoff_multiplier.powi((attempt - 1) as i32);
    let scaled = (config.base_delay_ms as f64 * factor) as u64;
    scaled.min(config.max_delay_ms)
}

async fn run_channel(
    scope: Scope,
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    config: ChannelConfig,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    'reconnect: loop {
        if *shutdown.borrow() {
            return;
        }
        match provider.subscribe(scope.clone()).await {
            Ok(mut subscription) => {
                attempt = 0;
                info!(scope = %scope, "subscribed");
                // Resync first: events missed while unsubscribed are lost.
                if signals.send(ChannelSignal::Resync).is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        event = subscription.next_event() => match event {
                            Some(event) => {
                                if signals.send(ChannelSignal::Event(event)).is_err() {
                                    return;
                                }
                            }
                            None => {
                                warn!(scope = %scope, "subscription dropped");
                                break;
                            }
                        },
                    }
                }
            }
            Err(error) => {
                warn!(scope = %scope, error = %error, "subscribe failed");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay_ms = backoff_delay_ms(&config, attempt);
        debug!(scope = %scope, attempt = attempt, delay_ms = delay_ms, "reconnecting after delay");
        tokio::select! {
            _ = shutdown.changed() => return,
            () = clock.sleep_ms(delay_ms) => continue 'reconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veranda_core::Table;
    use veranda_testkit::{InMemoryProvider, TestClock};

    fn config() -> ChannelConfig {
        ChannelConfig {
            base_delay_ms: 500,
            max_delay_ms: 4_000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_doubles_from_the_base_and_caps() {
        let config = config();
        let delays: Vec<u64> = (1..=6).map(|n| backoff_delay_ms(&config, n)).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
    }

    #[test]
    fn backoff_base_is_clamped_to_the_cap() {
        let config = ChannelConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(backoff_delay_ms(&config, 1), 1_000);
    }

    #[tokio::test]
    async fn resync_precedes_live_events_on_every_subscribe() {
        let provider = Arc::new(InMemoryProvider::new());
        let clock = Arc::new(TestClock::new());
        let scope = Scope::all(Table::Posts);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let channel = EventChannel::open(
            scope.clone(),
            provider.clone() as Arc<dyn ProviderEffects>,
            clock.clone() as Arc<dyn ClockEffects>,
            ChannelConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            tx,
        );

        assert!(matches!(rx.recv().await, Some(ChannelSignal::Resync)));

        provider.emit_insert(Table::Posts, veranda_testkit::fixtures::post().row());
        assert!(matches!(rx.recv().await, Some(ChannelSignal::Event(_))));

        // Sever the subscription: the channel must resubscribe and signal
        // another resync before any further events.
        provider.drop_subscriptions(&scope);
        assert!(matches!(rx.recv().await, Some(ChannelSignal::Resync)));

        channel.close();
    }

    #[tokio::test]
    async fn failed_subscribes_retry_until_one_succeeds() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.fail_next_subscribes(3);
        let clock = Arc::new(TestClock::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let channel = EventChannel::open(
            Scope::all(Table::Posts),
            provider.clone() as Arc<dyn ProviderEffects>,
            clock as Arc<dyn ClockEffects>,
            ChannelConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            tx,
        );

        assert!(matches!(rx.recv().await, Some(ChannelSignal::Resync)));
        assert_eq!(provider.subscribe_attempts(), 4);
        channel.close();
    }
}
