//! Optimistic mutations and the pending ledger.
//!
//! A user action is applied to local state immediately, recorded as a
//! [`PendingMutation`], and sent to the provider in a background task. The
//! pending entry resolves exactly once, through whichever of two paths
//! wins:
//!
//! * the provider request settles (success confirms, failure rolls back
//!   by applying the recorded [`UndoOp`]), or
//! * a change event echoing the write arrives first and confirms it; the
//!   late request result is then ignored.
//!
//! Targets are serialized: while a target has an outstanding pending
//! mutation, further mutations against it queue and start only after the
//! outstanding one resolves. That keeps rollbacks exact: at most one
//! optimistic step per target is in flight, and its undo reverses
//! precisely that step.
//!
//! The ledger is pure bookkeeping. It owns the reply channels and fires
//! them as entries resolve, but all state being mutated lives in the
//! reconcilers, which drive the ledger from their serial command loops.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;
use veranda_core::{
    ChatId, MessageId, MutationId, NotificationId, PostId, ProviderEffects, ProviderError, Row,
    Table, Timestamp,
};

use crate::error::SyncError;

// ─────────────────────────────────────────────────────────────────────────────
// Public mutation surface
// ─────────────────────────────────────────────────────────────────────────────

/// A user action performed optimistically.
///
/// Read-marking is not part of this enum: it has dedicated entry points on
/// the client because it never rolls back and never blocks its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Like a feed post.
    Like {
        /// Post to like.
        post: PostId,
    },
    /// Remove a like.
    Unlike {
        /// Post to unlike.
        post: PostId,
    },
    /// Repost a feed post.
    Repost {
        /// Post to repost.
        post: PostId,
    },
    /// Remove a repost.
    Unrepost {
        /// Post to unrepost.
        post: PostId,
    },
    /// Send a chat message.
    SendMessage {
        /// Destination chat.
        chat: ChatId,
        /// Message body.
        content: String,
    },
}

impl Mutation {
    /// The mutation's kind tag.
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Like { .. } => MutationKind::Like,
            Self::Unlike { .. } => MutationKind::Unlike,
            Self::Repost { .. } => MutationKind::Repost,
            Self::Unrepost { .. } => MutationKind::Unrepost,
            Self::SendMessage { .. } => MutationKind::SendMessage,
        }
    }

    /// The entity this mutation serializes against.
    pub fn target(&self) -> MutationTarget {
        match self {
            Self::Like { post }
            | Self::Unlike { post }
            | Self::Repost { post }
            | Self::Unrepost { post } => MutationTarget::Post(*post),
            Self::SendMessage { chat, .. } => MutationTarget::Chat(*chat),
        }
    }
}

/// Kind tag carried by pending entries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Like a post.
    Like,
    /// Remove a like.
    Unlike,
    /// Repost a post.
    Repost,
    /// Remove a repost.
    Unrepost,
    /// Send a chat message.
    SendMessage,
    /// Advance a read watermark.
    MarkRead,
}

impl MutationKind {
    /// Stable string form for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Unlike => "unlike",
            Self::Repost => "repost",
            Self::Unrepost => "unrepost",
            Self::SendMessage => "send_message",
            Self::MarkRead => "mark_read",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity a mutation is serialized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationTarget {
    /// A feed post.
    Post(PostId),
    /// A chat (messages and read watermark share the queue).
    Chat(ChatId),
    /// A notification.
    Notification(NotificationId),
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Post(id) => write!(f, "post:{id}"),
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Notification(id) => write!(f, "notification:{id}"),
        }
    }
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Applied locally, awaiting confirmation.
    Pending,
    /// Confirmed by the request or an echoed event.
    Confirmed,
    /// Request failed; the local effect was undone.
    RolledBack,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending entries
// ─────────────────────────────────────────────────────────────────────────────

/// The change event that counts as this mutation's echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EchoKey {
    /// Any posts-table event for this post.
    Post(PostId),
    /// A messages-table event carrying this client-generated id.
    Message(MessageId),
    /// A participants-table watermark update for this chat.
    ChatWatermark(ChatId),
    /// A notifications-table event for this notification.
    Notification(NotificationId),
}

/// How to reverse a locally applied mutation.
///
/// Undos are inverse steps, not snapshots: they touch only the fields the
/// mutation wrote, so server state that merged in while the request was in
/// flight survives a rollback.
#[derive(Debug, Clone)]
pub(crate) enum UndoOp {
    /// Nothing to reverse (read-marking never rolls back).
    None,
    /// Step a post interaction back by applying its inverse.
    RevertInteraction {
        /// Post the interaction touched.
        post: PostId,
        /// Interaction being reversed.
        kind: MutationKind,
    },
    /// Drop the optimistically inserted message.
    RemoveMessage {
        /// Chat the message was added to.
        chat: ChatId,
        /// Client-generated message id.
        message: MessageId,
    },
}

/// One optimistic mutation awaiting resolution.
#[derive(Debug)]
pub(crate) struct PendingMutation {
    /// Identity used to match the request settlement.
    pub id: MutationId,
    /// Kind tag.
    pub kind: MutationKind,
    /// Serialization target.
    pub target: MutationTarget,
    /// Event that confirms this mutation if it arrives first.
    pub echo: EchoKey,
    /// Lifecycle state.
    pub status: MutationStatus,
    /// Reversal applied on request failure.
    pub undo: UndoOp,
    /// Caller waiting on the outcome, if any.
    pub reply: Option<oneshot::Sender<Result<(), SyncError>>>,
    /// When the mutation was applied locally.
    pub created_at: Timestamp,
}

impl PendingMutation {
    /// A fresh pending entry with a new mutation id.
    pub fn new(
        kind: MutationKind,
        target: MutationTarget,
        echo: EchoKey,
        undo: UndoOp,
        reply: Option<oneshot::Sender<Result<(), SyncError>>>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: MutationId::new(),
            kind,
            target,
            echo,
            status: MutationStatus::Pending,
            undo,
            reply,
            created_at,
        }
    }

    fn resolve(mut self, outcome: Result<(), SyncError>) -> Self {
        debug_assert_eq!(
            self.status,
            MutationStatus::Pending,
            "pending entry resolved twice"
        );
        self.status = match outcome {
            Ok(()) => MutationStatus::Confirmed,
            Err(_) => MutationStatus::RolledBack,
        };
        if let Some(reply) = self.reply.take() {
            // The caller may have gone away; resolution stands regardless.
            let _ = reply.send(outcome);
        }
        self
    }
}

/// A mutation waiting for its target to free up.
#[derive(Debug)]
pub(crate) struct QueuedMutation<A> {
    /// Reconciler-specific action to start.
    pub action: A,
    /// Caller waiting on the outcome, if any.
    pub reply: Option<oneshot::Sender<Result<(), SyncError>>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

/// Resolution delivered when an echoed event confirms a pending mutation.
#[derive(Debug)]
pub(crate) struct EchoResolution<A> {
    /// Kind of the confirmed mutation.
    pub kind: MutationKind,
    /// Target that is now free.
    pub target: MutationTarget,
    /// Next queued mutation for the target, ready to start.
    pub next: Option<QueuedMutation<A>>,
}

/// Outcome of a provider request settling.
#[derive(Debug)]
pub(crate) enum Settlement<A> {
    /// The request succeeded and the pending entry was still open.
    Confirmed {
        /// Kind of the confirmed mutation.
        kind: MutationKind,
        /// Target that is now free.
        target: MutationTarget,
        /// Row returned by the provider, when the write produced one.
        row: Option<Row>,
        /// Next queued mutation for the target.
        next: Option<QueuedMutation<A>>,
    },
    /// The request failed; the caller must apply `undo`.
    RolledBack {
        /// Kind of the rolled-back mutation.
        kind: MutationKind,
        /// Target that is now free.
        target: MutationTarget,
        /// Reversal to apply to local state.
        undo: UndoOp,
        /// The failure, already delivered to the caller's reply channel.
        error: SyncError,
        /// Next queued mutation for the target.
        next: Option<QueuedMutation<A>>,
    },
    /// The pending entry was already resolved (usually by an echo), or the
    /// settlement belongs to a superseded mutation id.
    Stale {
        /// The late result, for logging.
        result: Result<Option<Row>, SyncError>,
    },
}

/// Pending mutations and their per-target queues.
///
/// `A` is the owning reconciler's action type, replayed when a queued
/// mutation reaches the front.
#[derive(Debug)]
pub(crate) struct PendingLedger<A> {
    outstanding: HashMap<MutationTarget, PendingMutation>,
    waiting: HashMap<MutationTarget, VecDeque<QueuedMutation<A>>>,
}

impl<A> Default for PendingLedger<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> PendingLedger<A> {
    /// An empty ledger.
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Whether the target already has an outstanding mutation.
    pub fn is_busy(&self, target: MutationTarget) -> bool {
        self.outstanding.contains_key(&target)
    }

    /// Park a mutation until its target frees up.
    pub fn enqueue(&mut self, target: MutationTarget, queued: QueuedMutation<A>) {
        self.waiting.entry(target).or_default().push_back(queued);
    }

    /// Record a mutation that has been applied locally and sent out.
    pub fn begin(&mut self, pending: PendingMutation) {
        debug_assert!(
            !self.is_busy(pending.target),
            "target {} already has an outstanding mutation",
            pending.target
        );
        self.outstanding.insert(pending.target, pending);
    }

    /// Kind of the outstanding mutation whose echo key matches, if any.
    ///
    /// Lets reconcilers corroborate an event's payload against the pending
    /// intent before treating the event as the echo.
    pub fn pending_kind(&self, key: EchoKey) -> Option<MutationKind> {
        self.outstanding
            .values()
            .find(|pending| pending.echo == key)
            .map(|pending| pending.kind)
    }

    /// Confirm the pending mutation matching an echoed change event.
    ///
    /// Returns `None` when no outstanding entry matches the key, which is
    /// the common case: most events are not echoes.
    pub fn confirm_echo(&mut self, key: EchoKey) -> Option<EchoResolution<A>> {
        let target = self
            .outstanding
            .iter()
            .find(|(_, pending)| pending.echo == key)
            .map(|(target, _)| *target)?;
        let pending = self.outstanding.remove(&target)?;
        let kind = pending.kind;
        pending.resolve(Ok(()));
        Some(EchoResolution {
            kind,
            target,
            next: self.take_next(target),
        })
    }

    /// Apply a provider request settlement.
    ///
    /// Settlements are matched by `(target, mutation_id)`; anything that no
    /// longer matches an open entry is reported as [`Settlement::Stale`] so
    /// the caller can log it, and resolves nothing a second time.
    pub fn settle(
        &mut self,
        target: MutationTarget,
        mutation_id: MutationId,
        result: Result<Option<Row>, SyncError>,
    ) -> Settlement<A> {
        match self.outstanding.remove(&target) {
            Some(pending) if pending.id == mutation_id => {
                let kind = pending.kind;
                match result {
                    Ok(row) => {
                        pending.resolve(Ok(()));
                        Settlement::Confirmed {
                            kind,
                            target,
                            row,
                            next: self.take_next(target),
                        }
                    }
                    Err(error) => {
                        let resolved = pending.resolve(Err(error.clone()));
                        Settlement::RolledBack {
                            kind,
                            target,
                            undo: resolved.undo,
                            error,
                            next: self.take_next(target),
                        }
                    }
                }
            }
            Some(other) => {
                self.outstanding.insert(target, other);
                Settlement::Stale { result }
            }
            None => Settlement::Stale { result },
        }
    }

    /// Resolve everything as failed, as on sign-out. Returns how many
    /// entries (outstanding plus queued) were flushed.
    pub fn fail_all(&mut self, error: &SyncError) -> usize {
        let mut flushed = 0;
        for (_, pending) in self.outstanding.drain() {
            debug!(
                kind = %pending.kind,
                target = %pending.target,
                created_at = %pending.created_at,
                "outstanding mutation failed on reset"
            );
            pending.resolve(Err(error.clone()));
            flushed += 1;
        }
        for (_, queue) in self.waiting.drain() {
            for mut queued in queue {
                if let Some(reply) = queued.reply.take() {
                    let _ = reply.send(Err(error.clone()));
                }
                flushed += 1;
            }
        }
        flushed
    }

    fn take_next(&mut self, target: MutationTarget) -> Option<QueuedMutation<A>> {
        let queue = self.waiting.get_mut(&target)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(&target);
        }
        next
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider writes
// ─────────────────────────────────────────────────────────────────────────────

/// The provider call a mutation issues.
#[derive(Debug, Clone)]
pub(crate) enum ProviderWrite {
    /// Insert a row.
    Insert {
        /// Destination table.
        table: Table,
        /// Full row to create.
        row: Row,
    },
    /// Patch columns of an existing row.
    Update {
        /// Destination table.
        table: Table,
        /// Row id.
        entity: Uuid,
        /// Columns to change.
        patch: Row,
    },
    /// Delete a row.
    Delete {
        /// Destination table.
        table: Table,
        /// Row id.
        entity: Uuid,
    },
}

impl ProviderWrite {
    async fn execute(
        self,
        provider: &Arc<dyn ProviderEffects>,
    ) -> Result<Option<Row>, ProviderError> {
        match self {
            Self::Insert { table, row } => provider.insert(table, row).await.map(Some),
            Self::Update {
                table,
                entity,
                patch,
            } => provider.update(table, entity, patch).await.map(Some),
            Self::Delete { table, entity } => provider.delete(table, entity).await.map(|()| None),
        }
    }
}

/// Run a provider write off the reconciler's queue and feed the settlement
/// back in as a command.
pub(crate) fn spawn_write<Cmd, F>(
    provider: Arc<dyn ProviderEffects>,
    commands: mpsc::UnboundedSender<Cmd>,
    target: MutationTarget,
    mutation_id: MutationId,
    write: ProviderWrite,
    settle: F,
) where
    Cmd: Send + 'static,
    F: FnOnce(MutationTarget, MutationId, Result<Option<Row>, ProviderError>) -> Cmd
        + Send
        + 'static,
{
    tokio::spawn(async move {
        let result = write.execute(&provider).await;
        // The reconciler may be gone during shutdown; nothing to settle then.
        let _ = commands.send(settle(target, mutation_id, result));
    });
}
