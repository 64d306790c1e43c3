//! Public engine facade.
//!
//! [`SyncClient`] is a thin front over three reconciler actors (chats,
//! notifications, feed) and the subscription manager that feeds them.
//! It owns the session: signing in seeds every reconciler with the viewer
//! and opens the session scopes, signing out tears all of it down. Reads
//! are cheap snapshot clones; mutations route to the owning reconciler
//! and resolve when the engine has settled them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use veranda_core::{
    ChatId, ClockEffects, NotificationId, OrderBy, ProviderEffects, Scope, SelectQuery, Table,
    UserId,
};

use crate::clock::SystemClock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::optimistic::Mutation;
use crate::read_state;
use crate::reconcile::chats::{self, ChatsHandle, ChatsSnapshot};
use crate::reconcile::feed::{self, FeedAction, FeedHandle, FeedSnapshot};
use crate::reconcile::notifications::{self, NotificationsHandle, NotificationsSnapshot};
use crate::subscriptions::{Route, SubscriptionManager, Targets};

/// The synchronization engine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Dropping
/// the client stops the reconcilers and closes every subscription.
pub struct SyncClient {
    provider: Arc<dyn ProviderEffects>,
    config: SyncConfig,
    session: Mutex<Option<UserId>>,
    subscriptions: Mutex<SubscriptionManager>,
    chats: ChatsHandle,
    notifications: NotificationsHandle,
    feed: FeedHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Build an engine over the given provider and clock.
    pub fn new(
        provider: Arc<dyn ProviderEffects>,
        clock: Arc<dyn ClockEffects>,
        config: SyncConfig,
    ) -> Self {
        let (chats, chats_task) = chats::spawn(provider.clone(), clock.clone());
        let (notifications, notifications_task) =
            notifications::spawn(provider.clone(), clock.clone());
        let (feed, feed_task) = feed::spawn(provider.clone(), clock.clone(), config.feed_page_size);
        let targets = Targets {
            chats: chats.clone(),
            notifications: notifications.clone(),
            feed: feed.clone(),
        };
        let subscriptions = SubscriptionManager::new(
            provider.clone(),
            clock,
            config.clone(),
            targets,
        );
        Self {
            provider,
            config,
            session: Mutex::new(None),
            subscriptions: Mutex::new(subscriptions),
            chats,
            notifications,
            feed,
            tasks: vec![chats_task, notifications_task, feed_task],
        }
    }

    /// Build an engine on the system clock.
    pub fn system(provider: Arc<dyn ProviderEffects>, config: SyncConfig) -> Self {
        Self::new(provider, Arc::new(SystemClock::new()), config)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────

    /// Sign a user in: seed the reconcilers with the viewer, then open the
    /// session scopes (chat list, notifications, feed).
    ///
    /// Signing in over an existing session signs the previous user out
    /// first, so state from two users never coexists.
    pub async fn sign_in(&self, user: UserId) -> Result<()> {
        if self.current_user().is_some() {
            self.sign_out().await?;
        }

        // The viewer must be in place before the first resync delivers
        // rows, so every reconciler is seeded before any scope opens.
        self.chats.set_session(user).await?;
        self.notifications.set_session(user).await?;
        self.feed.set_session(user).await?;

        {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.open(Scope::participants_of(user), Route::ChatList);
            subscriptions.open(Scope::notifications_of(user), Route::Notifications);
            subscriptions.open(Scope::feed(), Route::Feed);
        }

        *self.session.lock() = Some(user);
        info!(user = %user, "signed in");
        Ok(())
    }

    /// Sign out: close every subscription and clear all reconciler state.
    /// Pending mutations fail with [`SyncError::NoSession`].
    pub async fn sign_out(&self) -> Result<()> {
        self.subscriptions.lock().close_all();

        let error = SyncError::no_session("signed out");
        self.chats.clear(error.clone()).await?;
        self.notifications.clear(error.clone()).await?;
        self.feed.clear(error).await?;

        if let Some(user) = self.session.lock().take() {
            info!(user = %user, "signed out");
        }
        Ok(())
    }

    /// The signed-in user, if any.
    pub fn current_user(&self) -> Option<UserId> {
        *self.session.lock()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chats
    // ─────────────────────────────────────────────────────────────────────

    /// Open a chat's message thread: subscribe to its messages and load
    /// them on the resulting resync.
    pub fn open_chat(&self, chat: ChatId) -> Result<()> {
        self.require_session("open_chat")?;
        self.subscriptions
            .lock()
            .open(Scope::messages_of(chat), Route::Thread(chat));
        Ok(())
    }

    /// Close a chat's thread: drop the subscription and unload messages.
    /// The chat itself stays in the list with its last known summary.
    pub fn close_chat(&self, chat: ChatId) -> Result<()> {
        self.subscriptions.lock().close(&Scope::messages_of(chat));
        self.chats.close_thread(chat)
    }

    /// Mark a chat read at the current clock. Applies locally at once and
    /// resolves immediately; the watermark write happens in the background
    /// and is never rolled back.
    pub async fn mark_chat_read(&self, chat: ChatId) -> Result<()> {
        self.require_session("mark_chat_read")?;
        self.chats.mark_read(chat).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────

    /// Mark a notification read. Same contract as [`Self::mark_chat_read`].
    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<()> {
        self.require_session("mark_notification_read")?;
        self.notifications.mark_read(id).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Perform a user action optimistically.
    ///
    /// The local effect is visible in snapshots before this resolves; the
    /// returned future resolves once the mutation confirms (Ok) or rolls
    /// back (Err with the provider failure, local state already restored).
    pub async fn perform(&self, mutation: Mutation) -> Result<()> {
        self.require_session("perform")?;
        match mutation {
            Mutation::Like { post } => self.feed.perform(FeedAction::Like { post }).await,
            Mutation::Unlike { post } => self.feed.perform(FeedAction::Unlike { post }).await,
            Mutation::Repost { post } => self.feed.perform(FeedAction::Repost { post }).await,
            Mutation::Unrepost { post } => self.feed.perform(FeedAction::Unrepost { post }).await,
            Mutation::SendMessage { chat, content } => {
                self.chats.send_message(chat, content).await
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Feed paging
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch the next feed page and fold it into the feed.
    ///
    /// Returns whether more pages may exist. While a fetch is already in
    /// flight, or the feed is exhausted, this is a no-op returning the
    /// current `has_more`. A failed read leaves the cursor where it was
    /// and surfaces the provider failure.
    pub async fn fetch_next_page(&self) -> Result<bool> {
        self.require_session("fetch_next_page")?;
        let Some((range, generation)) = self.feed.begin_page().await? else {
            return Ok(self.feed.snapshot().has_more);
        };

        let query = SelectQuery::table(Table::Posts)
            .order(OrderBy::desc("created_at"))
            .range(range.offset, range.limit);
        match self.provider.select(query).await {
            Ok(rows) => {
                debug!(offset = range.offset, rows = rows.len(), "feed page fetched");
                self.feed.apply_page(generation, rows).await
            }
            Err(error) => {
                self.feed.abort_page(generation)?;
                Err(error.into())
            }
        }
    }

    /// Restart feed paging from the top without dropping loaded posts.
    /// Already-seen posts are skipped when refetched pages contain them.
    pub async fn reset_feed_cursor(&self) -> Result<()> {
        self.require_session("reset_feed_cursor")?;
        self.feed.reset_cursor().await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Current chat-list and thread state.
    pub fn chats(&self) -> Arc<ChatsSnapshot> {
        self.chats.snapshot()
    }

    /// Current notification state.
    pub fn notifications(&self) -> Arc<NotificationsSnapshot> {
        self.notifications.snapshot()
    }

    /// Current feed state.
    pub fn feed(&self) -> Arc<FeedSnapshot> {
        self.feed.snapshot()
    }

    /// Watch chat-list updates.
    pub fn watch_chats(&self) -> watch::Receiver<Arc<ChatsSnapshot>> {
        self.chats.watch()
    }

    /// Watch notification updates.
    pub fn watch_notifications(&self) -> watch::Receiver<Arc<NotificationsSnapshot>> {
        self.notifications.watch()
    }

    /// Watch feed updates.
    pub fn watch_feed(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.feed.watch()
    }

    /// Number of chats with unread activity.
    pub fn unread_chats(&self) -> usize {
        read_state::unread_chats(&self.chats.snapshot().chats)
    }

    /// Number of unread notifications. Independent of the chat counter.
    pub fn unread_notifications(&self) -> usize {
        read_state::unread_notifications(&self.notifications.snapshot().notifications)
    }

    /// The effective configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Stop the engine: close every subscription and end the reconcilers.
    pub fn shutdown(self) {
        drop(self);
    }

    fn require_session(&self, operation: &str) -> Result<()> {
        if self.session.lock().is_some() {
            Ok(())
        } else {
            Err(SyncError::no_session(operation))
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.subscriptions.lock().close_all();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("session", &*self.session.lock())
            .field("open_scopes", &self.subscriptions.lock().open_count())
            .finish()
    }
}
