//! Scope lifecycle and signal routing.
//!
//! The [`SubscriptionManager`] owns every open [`EventChannel`], keyed by
//! scope, and enforces the one-channel-per-scope rule: opening a scope
//! that is already open closes the existing channel first. Each channel
//! gets a dispatch task that consumes its signal stream in order —
//! a resync marker is answered with a full scope read fed to the owning
//! reconciler as a bulk replace, and live events are routed on.
//!
//! Because the resync read happens *after* the subscription is
//! established and its signal precedes the queued live events, nothing
//! emitted between subscribe and read completion is lost: such events are
//! applied after the replace, and re-applying a change the read already
//! contained is harmless by merge idempotence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veranda_core::{
    ChangeEvent, ChangeOp, ChatId, ClockEffects, OrderBy, ProviderEffects, Row, Scope, SelectQuery,
    Table,
};

use crate::channel::{backoff_delay_ms, ChannelSignal, EventChannel};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::reconcile::chats::ChatsHandle;
use crate::reconcile::feed::FeedHandle;
use crate::reconcile::notifications::NotificationsHandle;

/// Which reconciler a scope's signals feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Participant rows driving the chat list.
    ChatList,
    /// One open chat's messages.
    Thread(ChatId),
    /// The user's notifications.
    Notifications,
    /// The global ranked feed.
    Feed,
}

/// Handles for every reconciler a dispatch task may feed.
#[derive(Debug, Clone)]
pub(crate) struct Targets {
    pub chats: ChatsHandle,
    pub notifications: NotificationsHandle,
    pub feed: FeedHandle,
}

struct OpenScope {
    channel: EventChannel,
    dispatch: JoinHandle<()>,
}

impl OpenScope {
    fn close(self) {
        self.channel.close();
        self.dispatch.abort();
    }
}

/// Owner of all open channels and their dispatch tasks.
pub(crate) struct SubscriptionManager {
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    config: SyncConfig,
    targets: Targets,
    channels: HashMap<Scope, OpenScope>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        provider: Arc<dyn ProviderEffects>,
        clock: Arc<dyn ClockEffects>,
        config: SyncConfig,
        targets: Targets,
    ) -> Self {
        Self {
            provider,
            clock,
            config,
            targets,
            channels: HashMap::new(),
        }
    }

    /// Open a channel for `scope`, closing any existing one first.
    pub(crate) fn open(&mut self, scope: Scope, route: Route) {
        if let Some(existing) = self.channels.remove(&scope) {
            debug!(scope = %scope, "scope reopened; closing previous channel");
            existing.close();
        }
        let (signals, inbox) = mpsc::unbounded_channel();
        let channel = EventChannel::open(
            scope.clone(),
            self.provider.clone(),
            self.clock.clone(),
            self.config.channel.clone(),
            signals,
        );
        let dispatch = tokio::spawn(run_dispatch(
            scope.clone(),
            route,
            inbox,
            self.provider.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.targets.clone(),
        ));
        info!(scope = %scope, "scope opened");
        self.channels.insert(scope, OpenScope { channel, dispatch });
    }

    /// Close the channel for `scope`, if open.
    pub(crate) fn close(&mut self, scope: &Scope) -> bool {
        match self.channels.remove(scope) {
            Some(open) => {
                open.close();
                info!(scope = %scope, "scope closed");
                true
            }
            None => false,
        }
    }

    /// Close everything, as on sign-out.
    pub(crate) fn close_all(&mut self) {
        for (scope, open) in self.channels.drain() {
            debug!(scope = %scope, "scope closed");
            open.close();
        }
    }

    /// Whether a channel is open for `scope`.
    pub(crate) fn is_open(&self, scope: &Scope) -> bool {
        self.channels.contains_key(scope)
    }

    /// Number of open channels.
    pub(crate) fn open_count(&self) -> usize {
        self.channels.len()
    }
}

async fn run_dispatch(
    scope: Scope,
    route: Route,
    mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    config: SyncConfig,
    targets: Targets,
) {
    while let Some(signal) = signals.recv().await {
        let delivered = match signal {
            ChannelSignal::Resync => {
                resync(&scope, route, &provider, &clock, &config, &targets).await
            }
            ChannelSignal::Event(event) => route_event(route, event, &provider, &targets).await,
        };
        if delivered.is_err() {
            debug!(scope = %scope, "dispatch target gone; stopping");
            return;
        }
    }
}

/// Re-read a scope after a (re)subscribe and bulk-replace the reconciler's
/// state. Retries with backoff until the read succeeds; the only way out
/// is success or the scope being closed (which aborts this task).
async fn resync(
    scope: &Scope,
    route: Route,
    provider: &Arc<dyn ProviderEffects>,
    clock: &Arc<dyn ClockEffects>,
    config: &SyncConfig,
    targets: &Targets,
) -> Result<()> {
    let query = resync_query(scope, route, config);
    let mut attempt: u32 = 0;
    let rows = loop {
        match provider.select(query.clone()).await {
            Ok(rows) => break rows,
            Err(error) => {
                attempt = attempt.saturating_add(1);
                warn!(scope = %scope, error = %error, attempt = attempt, "resync read failed");
                clock.sleep_ms(backoff_delay_ms(&config.channel, attempt)).await;
            }
        }
    };
    info!(scope = %scope, rows = rows.len(), "resync complete");
    deliver_replace(route, rows, targets)
}

fn resync_query(scope: &Scope, route: Route, config: &SyncConfig) -> SelectQuery {
    match route {
        // The chat-list channel watches participant rows, but the state
        // being rebuilt is the chat rows themselves.
        Route::ChatList => SelectQuery::table(Table::Chats),
        Route::Thread(chat) => SelectQuery::table(Table::Messages)
            .filter("chat_id", chat)
            .order(OrderBy::asc("created_at")),
        Route::Notifications => SelectQuery::scope(scope).order(OrderBy::desc("created_at")),
        Route::Feed => SelectQuery::table(Table::Posts)
            .order(OrderBy::desc("created_at"))
            .range(0, config.feed_page_size),
    }
}

fn deliver_replace(route: Route, rows: Vec<Row>, targets: &Targets) -> Result<()> {
    match route {
        Route::ChatList => targets.chats.replace_chats(rows),
        Route::Thread(chat) => targets.chats.replace_messages(chat, rows),
        Route::Notifications => targets.notifications.replace(rows),
        Route::Feed => targets.feed.replace(rows),
    }
}

async fn route_event(
    route: Route,
    event: ChangeEvent,
    provider: &Arc<dyn ProviderEffects>,
    targets: &Targets,
) -> Result<()> {
    match route {
        Route::ChatList => {
            if event.op == ChangeOp::Insert {
                hydrate_chat(event, provider, targets).await
            } else {
                targets.chats.apply_participant_event(event)
            }
        }
        Route::Thread(chat) => targets.chats.apply_message_event(chat, event),
        Route::Notifications => targets.notifications.apply_event(event),
        Route::Feed => targets.feed.apply_event(event),
    }
}

/// A participant insert means the user joined a chat; the participant row
/// is not a chat, so point-read the chat it references. Failures here are
/// tolerated — the next resync carries the chat anyway.
async fn hydrate_chat(
    event: ChangeEvent,
    provider: &Arc<dyn ProviderEffects>,
    targets: &Targets,
) -> Result<()> {
    let Some(chat_id) = event.payload_uuid("chat_id") else {
        warn!(entity = %event.entity_id, "participant insert without chat_id");
        return Ok(());
    };
    let query = SelectQuery::table(Table::Chats).filter("id", chat_id);
    match provider.select(query).await {
        Ok(rows) => match rows.into_iter().next() {
            Some(row) => targets.chats.hydrated_chat(row),
            None => {
                debug!(chat = %chat_id, "joined chat not readable yet");
                Ok(())
            }
        },
        Err(error) => {
            warn!(chat = %chat_id, error = %error, "chat hydration failed");
            Ok(())
        }
    }
}
