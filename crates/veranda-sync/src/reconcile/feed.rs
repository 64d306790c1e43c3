//! Ranked feed reconciliation.
//!
//! The feed holds posts ordered by rank score (likes weighted double,
//! comments single, views half) with `created_at` as the tiebreak. Rank
//! scores are derived on every merge, so the ordering follows counter
//! changes from live events and optimistic interactions alike.
//!
//! The reconciler also owns the [`PaginationCursor`]: page fetches are a
//! two-step exchange (`begin_page` reserves the window, `apply_page`
//! folds the rows in) so the provider read runs outside the serial loop
//! while cursor state never leaves it. Live inserts register their ids
//! with the cursor, which is how a later page cannot reintroduce an
//! already-present post at a stale rank.
//!
//! Interactions are optimistic with absolute-state echoes: the local
//! apply adjusts the counter once, and the echoed posts event carries
//! absolute counts that merge over it, so the increment can never apply
//! twice. Interaction rows get deterministic ids derived from
//! `(post, user)`, which makes unlike/unrepost a plain delete and the
//! writes idempotent.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use veranda_core::{
    like_row_id, repost_row_id, ChangeEvent, ChangeOp, ClockEffects, FeedPost, MutationId,
    PageRange, PostId, ProviderEffects, ProviderError, Row, Table, UserId,
};

use crate::error::{Result, SyncError};
use crate::optimistic::{
    spawn_write, EchoKey, MutationKind, MutationTarget, PendingLedger, PendingMutation,
    ProviderWrite, QueuedMutation, Settlement, UndoOp,
};
use crate::pagination::PaginationCursor;
use crate::ranking;
use crate::reconcile::{Applied, Ordered, Record, RecordStore};

impl Record for FeedPost {
    type Id = PostId;

    fn record_id(&self) -> PostId {
        self.id
    }

    fn id_from_uuid(id: Uuid) -> PostId {
        PostId::from_uuid(id)
    }

    fn refresh_derived(&mut self) {
        ranking::refresh(self);
    }
}

impl Ordered for FeedPost {
    fn order_cmp(a: &Self, b: &Self) -> Ordering {
        b.rank_score
            .total_cmp(&a.rank_score)
            .then_with(|| b.created_at.cmp(&a.created_at))
    }

    fn order_changed(before: &Self, after: &Self) -> bool {
        before.rank_score.total_cmp(&after.rank_score) != Ordering::Equal
            || before.created_at != after.created_at
    }
}

/// Point-in-time view of the ranked feed.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    /// Posts, highest rank first.
    pub posts: Vec<FeedPost>,
    /// Whether another page may exist.
    pub has_more: bool,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            posts: Vec::new(),
            has_more: true,
        }
    }
}

impl FeedSnapshot {
    /// Look up a post by id.
    pub fn get(&self, id: PostId) -> Option<&FeedPost> {
        self.posts.iter().find(|post| post.id == id)
    }
}

/// Post interactions, queued per post while one is outstanding.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FeedAction {
    Like { post: PostId },
    Unlike { post: PostId },
    Repost { post: PostId },
    Unrepost { post: PostId },
}

impl FeedAction {
    fn post(self) -> PostId {
        match self {
            Self::Like { post }
            | Self::Unlike { post }
            | Self::Repost { post }
            | Self::Unrepost { post } => post,
        }
    }

    fn kind(self) -> MutationKind {
        match self {
            Self::Like { .. } => MutationKind::Like,
            Self::Unlike { .. } => MutationKind::Unlike,
            Self::Repost { .. } => MutationKind::Repost,
            Self::Unrepost { .. } => MutationKind::Unrepost,
        }
    }
}

#[derive(Debug)]
pub(crate) enum FeedCommand {
    SetSession {
        viewer: UserId,
        ack: oneshot::Sender<()>,
    },
    Clear {
        error: SyncError,
        ack: oneshot::Sender<()>,
    },
    Event(ChangeEvent),
    Replace(Vec<Row>),
    BeginPage {
        reply: oneshot::Sender<Option<(PageRange, u64)>>,
    },
    ApplyPage {
        generation: u64,
        rows: Vec<Row>,
        reply: oneshot::Sender<bool>,
    },
    AbortPage {
        generation: u64,
    },
    ResetCursor {
        ack: oneshot::Sender<()>,
    },
    Perform {
        action: FeedAction,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestSettled {
        target: MutationTarget,
        mutation_id: MutationId,
        result: std::result::Result<Option<Row>, ProviderError>,
    },
}

/// Cheap cloneable handle to the feed reconciler.
#[derive(Debug, Clone)]
pub(crate) struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    snapshot: watch::Receiver<Arc<FeedSnapshot>>,
}

impl FeedHandle {
    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.snapshot.clone()
    }

    pub fn apply_event(&self, event: ChangeEvent) -> Result<()> {
        self.send(FeedCommand::Event(event))
    }

    pub fn replace(&self, rows: Vec<Row>) -> Result<()> {
        self.send(FeedCommand::Replace(rows))
    }

    pub async fn set_session(&self, viewer: UserId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(FeedCommand::SetSession { viewer, ack })?;
        done.await.map_err(|_| closed())
    }

    pub async fn clear(&self, error: SyncError) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(FeedCommand::Clear { error, ack })?;
        done.await.map_err(|_| closed())
    }

    /// Reserve the next page window; `None` while a fetch is in flight or
    /// the feed is exhausted.
    pub async fn begin_page(&self) -> Result<Option<(PageRange, u64)>> {
        let (reply, done) = oneshot::channel();
        self.send(FeedCommand::BeginPage { reply })?;
        done.await.map_err(|_| closed())
    }

    /// Fold fetched rows into the feed; resolves to the new `has_more`.
    pub async fn apply_page(&self, generation: u64, rows: Vec<Row>) -> Result<bool> {
        let (reply, done) = oneshot::channel();
        self.send(FeedCommand::ApplyPage {
            generation,
            rows,
            reply,
        })?;
        done.await.map_err(|_| closed())
    }

    /// Abandon a failed page fetch.
    pub fn abort_page(&self, generation: u64) -> Result<()> {
        self.send(FeedCommand::AbortPage { generation })
    }

    /// Jump back to page zero, keeping seen ids.
    pub async fn reset_cursor(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(FeedCommand::ResetCursor { ack })?;
        done.await.map_err(|_| closed())
    }

    /// Run a post interaction optimistically; resolves when it confirms
    /// or rolls back.
    pub async fn perform(&self, action: FeedAction) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(FeedCommand::Perform { action, reply })?;
        done.await.map_err(|_| closed())?
    }

    fn send(&self, command: FeedCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> SyncError {
    SyncError::engine("feed reconciler is gone")
}

/// Start the feed reconciler.
pub(crate) fn spawn(
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    page_size: usize,
) -> (FeedHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::unbounded_channel();
    let (publish, snapshot) = watch::channel(Arc::new(FeedSnapshot::default()));
    let reconciler = FeedReconciler {
        provider,
        clock,
        commands: commands.clone(),
        viewer: None,
        store: RecordStore::new(),
        cursor: PaginationCursor::new(page_size),
        ledger: PendingLedger::new(),
        publish,
    };
    let task = tokio::spawn(reconciler.run(inbox));
    (FeedHandle { commands, snapshot }, task)
}

struct FeedReconciler {
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    viewer: Option<UserId>,
    store: RecordStore<FeedPost>,
    cursor: PaginationCursor,
    ledger: PendingLedger<FeedAction>,
    publish: watch::Sender<Arc<FeedSnapshot>>,
}

impl FeedReconciler {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<FeedCommand>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
            self.publish();
        }
    }

    fn handle(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::SetSession { viewer, ack } => {
                self.reset(SyncError::no_session("session changed"));
                self.viewer = Some(viewer);
                let _ = ack.send(());
            }
            FeedCommand::Clear { error, ack } => {
                self.reset(error);
                self.viewer = None;
                let _ = ack.send(());
            }
            FeedCommand::Event(event) => self.on_event(event),
            FeedCommand::Replace(rows) => self.on_replace(rows),
            FeedCommand::BeginPage { reply } => {
                let _ = reply.send(self.cursor.begin_page());
            }
            FeedCommand::ApplyPage {
                generation,
                rows,
                reply,
            } => {
                self.on_apply_page(generation, rows);
                let _ = reply.send(self.cursor.has_more());
            }
            FeedCommand::AbortPage { generation } => self.cursor.abort_page(generation),
            FeedCommand::ResetCursor { ack } => {
                self.cursor.reset();
                let _ = ack.send(());
            }
            FeedCommand::Perform { action, reply } => self.on_perform(action, reply),
            FeedCommand::RequestSettled {
                target,
                mutation_id,
                result,
            } => self.on_settled(target, mutation_id, result),
        }
    }

    fn reset(&mut self, error: SyncError) {
        let flushed = self.ledger.fail_all(&error);
        if flushed > 0 {
            debug!(flushed = flushed, "flushed pending feed mutations");
        }
        self.store.clear();
        self.cursor.clear();
    }

    // ── events and pages ─────────────────────────────────────────────────

    fn on_event(&mut self, event: ChangeEvent) {
        let post = PostId::from_uuid(event.entity_id);
        match self.store.apply_event(&event) {
            Ok(Applied::Inserted) => {
                // A live insert is now present; later pages must not bring
                // it back at a stale rank.
                self.cursor.note_seen(post);
            }
            Ok(_) => {}
            Err(error) => {
                if event.op == ChangeOp::Delete {
                    debug!(post = %post, error = %error, "feed delete for unknown post");
                } else {
                    warn!(post = %post, error = %error, "feed event skipped");
                }
            }
        }
        // Receipt confirms only when the payload shows the interaction
        // landed: the trigger echo carries the viewer flag in its new
        // state. An unrelated posts event (another user's counters) must
        // leave the entry pending, otherwise a later genuine failure
        // would settle as stale and the optimistic flag would stand.
        let echo = EchoKey::Post(post);
        if self
            .ledger
            .pending_kind(echo)
            .is_some_and(|kind| echo_confirms(kind, &event))
        {
            self.confirm(echo);
        }
    }

    fn on_replace(&mut self, rows: Vec<Row>) {
        let outcome = self.store.apply_bulk_replace(&rows);
        self.cursor.rebuild(self.store.iter().map(|post| post.id));
        debug!(
            inserted = outcome.inserted,
            merged = outcome.merged,
            removed = outcome.removed,
            skipped = outcome.skipped,
            "feed replaced"
        );
    }

    fn on_apply_page(&mut self, generation: u64, rows: Vec<Row>) {
        // has_more comes from the unfiltered count: a page full of
        // already-seen rows still means the provider had a full window.
        if !self.cursor.complete_page(generation, rows.len()) {
            debug!(rows = rows.len(), "stale page fetch discarded");
            return;
        }
        let mut applied = 0usize;
        let mut duplicates = 0usize;
        for row in &rows {
            let Some(id) = row
                .get("id")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse::<Uuid>().ok())
                .map(PostId::from_uuid)
            else {
                warn!("page row without usable id skipped");
                continue;
            };
            if !self.cursor.note_seen(id) {
                duplicates += 1;
                continue;
            }
            match self.store.apply_row(row) {
                Ok(_) => applied += 1,
                Err(error) => warn!(post = %id, error = %error, "page row rejected"),
            }
        }
        debug!(
            applied = applied,
            duplicates = duplicates,
            page = self.cursor.page_index(),
            has_more = self.cursor.has_more(),
            "page applied"
        );
    }

    // ── optimistic interactions ──────────────────────────────────────────

    fn on_perform(&mut self, action: FeedAction, reply: oneshot::Sender<Result<()>>) {
        if self.viewer.is_none() {
            let _ = reply.send(Err(SyncError::no_session(action.kind().as_str())));
            return;
        }
        let target = MutationTarget::Post(action.post());
        if self.ledger.is_busy(target) {
            self.ledger.enqueue(
                target,
                QueuedMutation {
                    action,
                    reply: Some(reply),
                },
            );
        } else {
            self.start(action, Some(reply));
        }
    }

    fn start(&mut self, action: FeedAction, reply: Option<oneshot::Sender<Result<()>>>) {
        let Some(viewer) = self.viewer else {
            respond(reply, Err(SyncError::no_session(action.kind().as_str())));
            return;
        };
        let post = action.post();
        let Some(previous) = self.store.get(post) else {
            respond(
                reply,
                Err(SyncError::request(format!("post {post} is not in the feed"))),
            );
            return;
        };

        // Interactions already in the requested state are no-ops; the
        // deterministic row ids make the write idempotent anyway, so this
        // is purely to avoid double-counting locally.
        let noop = match action {
            FeedAction::Like { .. } => previous.viewer_has_liked,
            FeedAction::Unlike { .. } => !previous.viewer_has_liked,
            FeedAction::Repost { .. } => previous.viewer_has_reposted,
            FeedAction::Unrepost { .. } => !previous.viewer_has_reposted,
        };
        if noop {
            respond(reply, Ok(()));
            return;
        }

        self.store.update_with(post, |record| match action {
            FeedAction::Like { .. } => {
                record.like_count += 1;
                record.viewer_has_liked = true;
                true
            }
            FeedAction::Unlike { .. } => {
                record.like_count = record.like_count.saturating_sub(1);
                record.viewer_has_liked = false;
                true
            }
            FeedAction::Repost { .. } => {
                record.viewer_has_reposted = true;
                false
            }
            FeedAction::Unrepost { .. } => {
                record.viewer_has_reposted = false;
                false
            }
        });

        let write = match action {
            FeedAction::Like { .. } => ProviderWrite::Insert {
                table: Table::Likes,
                row: interaction_row(like_row_id(post, viewer), post, viewer),
            },
            FeedAction::Unlike { .. } => ProviderWrite::Delete {
                table: Table::Likes,
                entity: like_row_id(post, viewer),
            },
            FeedAction::Repost { .. } => ProviderWrite::Insert {
                table: Table::Reposts,
                row: interaction_row(repost_row_id(post, viewer), post, viewer),
            },
            FeedAction::Unrepost { .. } => ProviderWrite::Delete {
                table: Table::Reposts,
                entity: repost_row_id(post, viewer),
            },
        };

        let pending = PendingMutation::new(
            action.kind(),
            MutationTarget::Post(post),
            EchoKey::Post(post),
            UndoOp::RevertInteraction {
                post,
                kind: action.kind(),
            },
            reply,
            self.clock.now(),
        );
        let mutation_id = pending.id;
        self.ledger.begin(pending);
        spawn_write(
            self.provider.clone(),
            self.commands.clone(),
            MutationTarget::Post(post),
            mutation_id,
            write,
            |target, mutation_id, result| FeedCommand::RequestSettled {
                target,
                mutation_id,
                result,
            },
        );
    }

    fn on_settled(
        &mut self,
        target: MutationTarget,
        mutation_id: MutationId,
        result: std::result::Result<Option<Row>, ProviderError>,
    ) {
        let result = result.map_err(SyncError::from);
        match self.ledger.settle(target, mutation_id, result) {
            Settlement::Confirmed { kind, target, next, .. } => {
                // The interaction row itself is not post state; authority
                // for the counters arrives with the echoed posts event.
                debug!(kind = %kind, target = %target, "mutation confirmed by request");
                self.start_next(next);
            }
            Settlement::RolledBack {
                kind,
                target,
                undo,
                error,
                next,
            } => {
                warn!(kind = %kind, target = %target, error = %error, "mutation rolled back");
                self.apply_undo(undo);
                self.start_next(next);
            }
            Settlement::Stale { result } => {
                if let Err(error) = result {
                    debug!(target = %target, error = %error, "late failure ignored; state follows the echo");
                }
            }
        }
    }

    fn apply_undo(&mut self, undo: UndoOp) {
        match undo {
            UndoOp::RevertInteraction { post, kind } => self.revert_interaction(post, kind),
            UndoOp::None => {}
            UndoOp::RemoveMessage { .. } => {
                warn!("message undo reached the feed reconciler");
            }
        }
    }

    /// Inverse of the optimistic apply in [`Self::start`]: only the fields
    /// the interaction wrote are stepped back, so server changes that merged
    /// while the request was in flight survive the rollback.
    fn revert_interaction(&mut self, post: PostId, kind: MutationKind) {
        self.store.update_with(post, |record| match kind {
            MutationKind::Like => {
                record.like_count = record.like_count.saturating_sub(1);
                record.viewer_has_liked = false;
                true
            }
            MutationKind::Unlike => {
                record.like_count += 1;
                record.viewer_has_liked = true;
                true
            }
            MutationKind::Repost => {
                record.viewer_has_reposted = false;
                false
            }
            MutationKind::Unrepost => {
                record.viewer_has_reposted = true;
                false
            }
            // Chat kinds never produce an interaction undo.
            MutationKind::SendMessage | MutationKind::MarkRead => false,
        });
    }

    fn start_next(&mut self, next: Option<QueuedMutation<FeedAction>>) {
        if let Some(queued) = next {
            self.start(queued.action, queued.reply);
        }
    }

    fn confirm(&mut self, key: EchoKey) {
        if let Some(resolution) = self.ledger.confirm_echo(key) {
            debug!(kind = %resolution.kind, target = %resolution.target, "mutation confirmed by echo");
            self.start_next(resolution.next);
        }
    }

    fn publish(&self) {
        let snapshot = FeedSnapshot {
            posts: self.store.snapshot(),
            has_more: self.cursor.has_more(),
        };
        let _ = self.publish.send(Arc::new(snapshot));
    }
}

fn interaction_row(id: Uuid, post: PostId, user: UserId) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), Value::String(id.to_string()));
    row.insert("post_id".to_string(), Value::String(post.to_string()));
    row.insert("user_id".to_string(), Value::String(user.to_string()));
    row
}

/// Whether a posts event is the echo of the given pending interaction:
/// its payload must carry the viewer flag the interaction drove toward.
fn echo_confirms(kind: MutationKind, event: &ChangeEvent) -> bool {
    let flag = |column: &str| event.payload.get(column).and_then(Value::as_bool);
    match kind {
        MutationKind::Like => flag("viewer_has_liked") == Some(true),
        MutationKind::Unlike => flag("viewer_has_liked") == Some(false),
        MutationKind::Repost => flag("viewer_has_reposted") == Some(true),
        MutationKind::Unrepost => flag("viewer_has_reposted") == Some(false),
        MutationKind::SendMessage | MutationKind::MarkRead => false,
    }
}

fn respond(reply: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
