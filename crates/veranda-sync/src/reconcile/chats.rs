//! Chat list and message-thread reconciliation.
//!
//! One reconciler owns both the chat list and every loaded message thread,
//! because the two are coupled: a message event can move a chat in the
//! list (`last_message` drives the ordering) and flip its unread flag. All
//! state changes — live events, bulk replaces, optimistic sends, read
//! marks, request settlements — go through a single command loop, so no
//! two of them ever interleave.
//!
//! `last_message` is derived. While a chat's thread is loaded it is
//! recomputed from the thread after every change (the maximum `created_at`
//! still present, none when the thread is empty). For chats whose thread
//! is not loaded, the value merged from chat rows is carried as-is.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use veranda_core::{
    encode_row, ChangeEvent, ChangeOp, Chat, ChatId, ClockEffects, Message, MessageId, MutationId,
    ProviderEffects, ProviderError, Row, Table, Timestamp, UserId,
};

use crate::error::{Result, SyncError};
use crate::optimistic::{
    spawn_write, EchoKey, MutationKind, MutationTarget, PendingLedger, PendingMutation,
    ProviderWrite, QueuedMutation, Settlement, UndoOp,
};
use crate::read_state;
use crate::reconcile::{Ordered, Record, RecordStore};

// ─────────────────────────────────────────────────────────────────────────────
// Record wiring
// ─────────────────────────────────────────────────────────────────────────────

impl Record for Chat {
    type Id = ChatId;

    fn record_id(&self) -> ChatId {
        self.id
    }

    fn id_from_uuid(id: Uuid) -> ChatId {
        ChatId::from_uuid(id)
    }

    fn refresh_derived(&mut self) {
        self.refresh_unread();
    }
}

impl Ordered for Chat {
    // Most recent activity first; chats that have never seen a message
    // fall back to their creation time.
    fn order_cmp(a: &Self, b: &Self) -> Ordering {
        let a_key = a.activity_key().unwrap_or(a.created_at);
        let b_key = b.activity_key().unwrap_or(b.created_at);
        b_key.cmp(&a_key)
    }

    fn order_changed(before: &Self, after: &Self) -> bool {
        before.activity_key() != after.activity_key() || before.created_at != after.created_at
    }
}

impl Record for Message {
    type Id = MessageId;

    fn record_id(&self) -> MessageId {
        self.id
    }

    fn id_from_uuid(id: Uuid) -> MessageId {
        MessageId::from_uuid(id)
    }
}

impl Ordered for Message {
    fn order_cmp(a: &Self, b: &Self) -> Ordering {
        a.created_at.cmp(&b.created_at)
    }

    fn order_changed(before: &Self, after: &Self) -> bool {
        before.created_at != after.created_at
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of the chat list and loaded message threads.
#[derive(Debug, Clone, Default)]
pub struct ChatsSnapshot {
    /// Chats, most recent activity first.
    pub chats: Vec<Chat>,
    /// Messages per loaded thread, oldest first.
    pub messages: HashMap<ChatId, Vec<Message>>,
}

impl ChatsSnapshot {
    /// Look up a chat by id.
    pub fn chat(&self, id: ChatId) -> Option<&Chat> {
        self.chats.iter().find(|chat| chat.id == id)
    }

    /// The loaded thread for a chat, empty when not loaded.
    pub fn thread(&self, id: ChatId) -> &[Message] {
        self.messages.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands and handle
// ─────────────────────────────────────────────────────────────────────────────

/// Mutations that park while their chat has one outstanding.
#[derive(Debug)]
enum ChatAction {
    Send { chat: ChatId, content: String },
    MarkRead { chat: ChatId },
}

#[derive(Debug)]
pub(crate) enum ChatsCommand {
    SetSession {
        viewer: UserId,
        ack: oneshot::Sender<()>,
    },
    Clear {
        error: SyncError,
        ack: oneshot::Sender<()>,
    },
    ParticipantEvent(ChangeEvent),
    HydratedChat(Row),
    ReplaceChats(Vec<Row>),
    MessageEvent {
        chat: ChatId,
        event: ChangeEvent,
    },
    ReplaceMessages {
        chat: ChatId,
        rows: Vec<Row>,
    },
    CloseThread {
        chat: ChatId,
    },
    Send {
        chat: ChatId,
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkRead {
        chat: ChatId,
        ack: oneshot::Sender<Result<()>>,
    },
    RequestSettled {
        target: MutationTarget,
        mutation_id: MutationId,
        result: std::result::Result<Option<Row>, ProviderError>,
    },
}

/// Cheap cloneable handle to the chats reconciler.
#[derive(Debug, Clone)]
pub(crate) struct ChatsHandle {
    commands: mpsc::UnboundedSender<ChatsCommand>,
    snapshot: watch::Receiver<Arc<ChatsSnapshot>>,
}

impl ChatsHandle {
    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ChatsSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<Arc<ChatsSnapshot>> {
        self.snapshot.clone()
    }

    pub fn apply_participant_event(&self, event: ChangeEvent) -> Result<()> {
        self.send(ChatsCommand::ParticipantEvent(event))
    }

    pub fn hydrated_chat(&self, row: Row) -> Result<()> {
        self.send(ChatsCommand::HydratedChat(row))
    }

    pub fn replace_chats(&self, rows: Vec<Row>) -> Result<()> {
        self.send(ChatsCommand::ReplaceChats(rows))
    }

    pub fn apply_message_event(&self, chat: ChatId, event: ChangeEvent) -> Result<()> {
        self.send(ChatsCommand::MessageEvent { chat, event })
    }

    pub fn replace_messages(&self, chat: ChatId, rows: Vec<Row>) -> Result<()> {
        self.send(ChatsCommand::ReplaceMessages { chat, rows })
    }

    pub fn close_thread(&self, chat: ChatId) -> Result<()> {
        self.send(ChatsCommand::CloseThread { chat })
    }

    /// Reset state for a newly signed-in user.
    pub async fn set_session(&self, viewer: UserId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(ChatsCommand::SetSession { viewer, ack })?;
        done.await.map_err(|_| closed())
    }

    /// Drop all state and fail outstanding mutations with `error`.
    pub async fn clear(&self, error: SyncError) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(ChatsCommand::Clear { error, ack })?;
        done.await.map_err(|_| closed())
    }

    /// Send a message optimistically; resolves when the send confirms or
    /// rolls back.
    pub async fn send_message(&self, chat: ChatId, content: String) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(ChatsCommand::Send {
            chat,
            content,
            reply,
        })?;
        done.await.map_err(|_| closed())?
    }

    /// Mark a chat read; resolves once the local watermark has advanced.
    pub async fn mark_read(&self, chat: ChatId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(ChatsCommand::MarkRead { chat, ack })?;
        done.await.map_err(|_| closed())?
    }

    fn send(&self, command: ChatsCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> SyncError {
    SyncError::engine("chats reconciler is gone")
}

/// Start the chats reconciler.
pub(crate) fn spawn(
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
) -> (ChatsHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::unbounded_channel();
    let (publish, snapshot) = watch::channel(Arc::new(ChatsSnapshot::default()));
    let reconciler = ChatsReconciler {
        provider,
        clock,
        commands: commands.clone(),
        viewer: None,
        chats: RecordStore::new(),
        messages: HashMap::new(),
        ledger: PendingLedger::new(),
        publish,
    };
    let task = tokio::spawn(reconciler.run(inbox));
    (ChatsHandle { commands, snapshot }, task)
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────────────────────────

struct ChatsReconciler {
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    commands: mpsc::UnboundedSender<ChatsCommand>,
    viewer: Option<UserId>,
    chats: RecordStore<Chat>,
    messages: HashMap<ChatId, RecordStore<Message>>,
    ledger: PendingLedger<ChatAction>,
    publish: watch::Sender<Arc<ChatsSnapshot>>,
}

impl ChatsReconciler {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ChatsCommand>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
            self.publish();
        }
    }

    fn handle(&mut self, command: ChatsCommand) {
        match command {
            ChatsCommand::SetSession { viewer, ack } => {
                self.reset(SyncError::no_session("session changed"));
                self.viewer = Some(viewer);
                let _ = ack.send(());
            }
            ChatsCommand::Clear { error, ack } => {
                self.reset(error);
                self.viewer = None;
                let _ = ack.send(());
            }
            ChatsCommand::ParticipantEvent(event) => self.on_participant_event(event),
            ChatsCommand::HydratedChat(row) => self.on_hydrated_chat(row),
            ChatsCommand::ReplaceChats(rows) => self.on_replace_chats(rows),
            ChatsCommand::MessageEvent { chat, event } => self.on_message_event(chat, event),
            ChatsCommand::ReplaceMessages { chat, rows } => {
                let outcome = self.messages.entry(chat).or_default().apply_bulk_replace(&rows);
                debug!(chat = %chat, inserted = outcome.inserted, removed = outcome.removed, "thread replaced");
                self.refresh_last_message(chat);
            }
            ChatsCommand::CloseThread { chat } => {
                // The chat keeps its computed last_message; only the loaded
                // thread goes away.
                self.messages.remove(&chat);
            }
            ChatsCommand::Send {
                chat,
                content,
                reply,
            } => {
                let target = MutationTarget::Chat(chat);
                if self.ledger.is_busy(target) {
                    self.ledger.enqueue(
                        target,
                        QueuedMutation {
                            action: ChatAction::Send { chat, content },
                            reply: Some(reply),
                        },
                    );
                } else {
                    self.start_send(chat, content, Some(reply));
                }
            }
            ChatsCommand::MarkRead { chat, ack } => self.on_mark_read(chat, ack),
            ChatsCommand::RequestSettled {
                target,
                mutation_id,
                result,
            } => self.on_settled(target, mutation_id, result),
        }
    }

    fn reset(&mut self, error: SyncError) {
        let flushed = self.ledger.fail_all(&error);
        if flushed > 0 {
            debug!(flushed = flushed, "flushed pending chat mutations");
        }
        self.chats.clear();
        self.messages.clear();
    }

    // ── events ───────────────────────────────────────────────────────────

    fn on_participant_event(&mut self, event: ChangeEvent) {
        match event.op {
            // Inserts are hydrated into full chat rows upstream; one
            // reaching this loop means hydration was skipped.
            ChangeOp::Insert => {
                debug!(entity = %event.entity_id, "unhydrated participant insert ignored");
            }
            ChangeOp::Update => {
                let chat = event
                    .payload_uuid("chat_id")
                    .map(ChatId::from_uuid)
                    .or_else(|| self.chat_of_participant(event.entity_id));
                let Some(chat) = chat else {
                    warn!(entity = %event.entity_id, "watermark update for unknown chat");
                    return;
                };
                let Some(at) = event
                    .payload
                    .get("last_read_at")
                    .and_then(Value::as_u64)
                    .map(Timestamp::from_millis)
                else {
                    debug!(chat = %chat, "participant update without watermark");
                    return;
                };
                self.chats.update_with(chat, |record| {
                    read_state::apply_watermark(record, at);
                    false
                });
                self.confirm(EchoKey::ChatWatermark(chat));
            }
            ChangeOp::Delete => {
                let Some(chat) = self.chat_of_participant(event.entity_id) else {
                    debug!(entity = %event.entity_id, "participant delete for unknown chat");
                    return;
                };
                self.chats.remove(chat);
                self.messages.remove(&chat);
                debug!(chat = %chat, "left chat");
            }
        }
    }

    fn on_replace_chats(&mut self, rows: Vec<Row>) {
        // A full read can lag the viewer's own mark-read: the watermark
        // lives on participant rows, while chat rows carry whatever the
        // read returned. Watermarks only move forward, so the pre-merge
        // values are reapplied and the newer side wins.
        let watermarks: Vec<(ChatId, Timestamp)> = self
            .chats
            .iter()
            .filter_map(|chat| chat.last_read_at.map(|at| (chat.id, at)))
            .collect();
        let outcome = self.chats.apply_bulk_replace(&rows);
        for (chat, at) in watermarks {
            self.chats.update_with(chat, |record| {
                read_state::apply_watermark(record, at);
                false
            });
        }
        let chats = &self.chats;
        self.messages.retain(|chat, _| chats.contains(*chat));
        let loaded: Vec<ChatId> = self.messages.keys().copied().collect();
        for chat in loaded {
            self.refresh_last_message(chat);
        }
        debug!(
            inserted = outcome.inserted,
            merged = outcome.merged,
            removed = outcome.removed,
            skipped = outcome.skipped,
            "chat list replaced"
        );
    }

    fn on_hydrated_chat(&mut self, row: Row) {
        // Point reads lag the viewer's mark-read the same way bulk reads
        // do; the held watermark is reapplied forward-only after the merge.
        let chat = row
            .get("id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<Uuid>().ok())
            .map(ChatId::from_uuid);
        let held = chat
            .and_then(|chat| self.chats.get(chat))
            .and_then(|record| record.last_read_at);
        match self.chats.apply_row(&row) {
            Ok(applied) => debug!(applied = ?applied, "hydrated chat applied"),
            Err(error) => warn!(error = %error, "hydrated chat row rejected"),
        }
        if let (Some(chat), Some(at)) = (chat, held) {
            self.chats.update_with(chat, |record| {
                read_state::apply_watermark(record, at);
                false
            });
        }
    }

    fn on_message_event(&mut self, chat: ChatId, event: ChangeEvent) {
        let applied = self
            .messages
            .entry(chat)
            .or_default()
            .apply_event(&event);
        match applied {
            Ok(_) => self.refresh_last_message(chat),
            Err(error) => warn!(chat = %chat, error = %error, "message event skipped"),
        }
        // Receipt confirms, whatever the op: any event for the echoed id
        // means the write reached the backend.
        self.confirm(EchoKey::Message(MessageId::from_uuid(event.entity_id)));
    }

    // ── optimistic mutations ─────────────────────────────────────────────

    fn start_send(
        &mut self,
        chat: ChatId,
        content: String,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let Some(viewer) = self.viewer else {
            respond(reply, Err(SyncError::no_session("send_message")));
            return;
        };
        if !self.chats.contains(chat) {
            respond(
                reply,
                Err(SyncError::request(format!("chat {chat} is not in the chat list"))),
            );
            return;
        }
        let now = self.clock.now();
        let message = Message {
            id: MessageId::new(),
            chat_id: chat,
            sender_id: viewer,
            content,
            created_at: now,
            is_read: false,
        };
        let row = match encode_row(&message) {
            Ok(row) => row,
            Err(error) => {
                respond(reply, Err(SyncError::decode(error.to_string())));
                return;
            }
        };

        self.messages.entry(chat).or_default().upsert(message.clone());
        self.refresh_last_message(chat);

        let pending = PendingMutation::new(
            MutationKind::SendMessage,
            MutationTarget::Chat(chat),
            EchoKey::Message(message.id),
            UndoOp::RemoveMessage {
                chat,
                message: message.id,
            },
            reply,
            now,
        );
        let mutation_id = pending.id;
        self.ledger.begin(pending);
        spawn_write(
            self.provider.clone(),
            self.commands.clone(),
            MutationTarget::Chat(chat),
            mutation_id,
            ProviderWrite::Insert {
                table: Table::Messages,
                row,
            },
            |target, mutation_id, result| ChatsCommand::RequestSettled {
                target,
                mutation_id,
                result,
            },
        );
    }

    fn on_mark_read(&mut self, chat: ChatId, ack: oneshot::Sender<Result<()>>) {
        // The unread flag clears immediately and never rolls back; only
        // the provider write is serialized behind other chat mutations.
        let now = self.clock.now();
        let mut advanced = false;
        let found = self.chats.update_with(chat, |record| {
            advanced = read_state::mark_chat_read(record, now);
            false
        });
        if !found {
            let _ = ack.send(Err(SyncError::request(format!(
                "chat {chat} is not in the chat list"
            ))));
            return;
        }
        let _ = ack.send(Ok(()));
        if !advanced {
            return;
        }
        let target = MutationTarget::Chat(chat);
        if self.ledger.is_busy(target) {
            self.ledger.enqueue(
                target,
                QueuedMutation {
                    action: ChatAction::MarkRead { chat },
                    reply: None,
                },
            );
        } else {
            self.start_mark_read_write(chat);
        }
    }

    fn start_mark_read_write(&mut self, chat: ChatId) {
        let Some(viewer) = self.viewer else {
            return;
        };
        let record = self.chats.get(chat);
        let Some(participant) = record.and_then(|c| c.participant_for(viewer)).map(|p| p.id) else {
            debug!(chat = %chat, "no participant row for viewer; watermark not persisted");
            return;
        };
        let Some(at) = record.and_then(|c| c.last_read_at) else {
            return;
        };
        let mut patch = Row::new();
        patch.insert("last_read_at".to_string(), Value::from(at.as_millis()));

        let pending = PendingMutation::new(
            MutationKind::MarkRead,
            MutationTarget::Chat(chat),
            EchoKey::ChatWatermark(chat),
            UndoOp::None,
            None,
            self.clock.now(),
        );
        let mutation_id = pending.id;
        self.ledger.begin(pending);
        spawn_write(
            self.provider.clone(),
            self.commands.clone(),
            MutationTarget::Chat(chat),
            mutation_id,
            ProviderWrite::Update {
                table: Table::Participants,
                entity: participant,
                patch,
            },
            |target, mutation_id, result| ChatsCommand::RequestSettled {
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
            Settlement::Confirmed {
                kind,
                target,
                row,
                next,
            } => {
                debug!(kind = %kind, target = %target, "mutation confirmed by request");
                if kind == MutationKind::SendMessage {
                    if let (MutationTarget::Chat(chat), Some(row)) = (target, row) {
                        self.apply_confirmed_message(chat, row);
                    }
                }
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
            Settlement::Stale { result } => match result {
                Ok(_) => debug!(target = %target, "late settlement after echo confirmation"),
                Err(error) => {
                    debug!(target = %target, error = %error, "late failure ignored; state follows the echo");
                }
            },
        }
    }

    // The provider may assign server-side fields (timestamps in
    // particular); fold its row back into the thread.
    fn apply_confirmed_message(&mut self, chat: ChatId, row: Row) {
        if let Some(store) = self.messages.get_mut(&chat) {
            if let Err(error) = store.apply_row(&row) {
                warn!(chat = %chat, error = %error, "confirmed message row rejected");
            }
        }
        self.refresh_last_message(chat);
    }

    fn apply_undo(&mut self, undo: UndoOp) {
        match undo {
            UndoOp::RemoveMessage { chat, message } => {
                if let Some(store) = self.messages.get_mut(&chat) {
                    store.remove(message);
                }
                self.refresh_last_message(chat);
            }
            UndoOp::None => {}
            UndoOp::RevertInteraction { .. } => {
                warn!("post undo reached the chats reconciler");
            }
        }
    }

    fn start_next(&mut self, next: Option<QueuedMutation<ChatAction>>) {
        let Some(queued) = next else {
            return;
        };
        match queued.action {
            ChatAction::Send { chat, content } => self.start_send(chat, content, queued.reply),
            ChatAction::MarkRead { chat } => self.start_mark_read_write(chat),
        }
    }

    fn confirm(&mut self, key: EchoKey) {
        if let Some(resolution) = self.ledger.confirm_echo(key) {
            debug!(kind = %resolution.kind, target = %resolution.target, "mutation confirmed by echo");
            self.start_next(resolution.next);
        }
    }

    // ── derived state ────────────────────────────────────────────────────

    fn chat_of_participant(&self, row_id: Uuid) -> Option<ChatId> {
        self.chats
            .iter()
            .find(|chat| chat.has_participant_row(row_id))
            .map(|chat| chat.id)
    }

    /// Recompute a chat's `last_message` from its loaded thread. Chats
    /// without a loaded thread keep whatever the chat row carried.
    fn refresh_last_message(&mut self, chat: ChatId) {
        let Some(store) = self.messages.get(&chat) else {
            return;
        };
        let last = store
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned();
        self.chats.update_with(chat, |record| {
            let moved = record.last_message.as_ref().map(|m| m.created_at)
                != last.as_ref().map(|m| m.created_at);
            record.last_message = last;
            moved
        });
    }

    fn publish(&self) {
        let snapshot = ChatsSnapshot {
            chats: self.chats.snapshot(),
            messages: self
                .messages
                .iter()
                .map(|(chat, store)| (*chat, store.snapshot()))
                .collect(),
        };
        let _ = self.publish.send(Arc::new(snapshot));
    }
}

fn respond(reply: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use veranda_testkit::{fixtures, InMemoryProvider, TestClock};

    async fn settle() {
        // Let the reconciler loop and any spawned writes run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    struct Harness {
        provider: Arc<InMemoryProvider>,
        clock: Arc<TestClock>,
        handle: ChatsHandle,
        viewer: UserId,
    }

    async fn harness() -> Harness {
        let provider = Arc::new(InMemoryProvider::new());
        let clock = Arc::new(TestClock::at(10_000));
        let viewer = UserId::new();
        let (handle, _task) = spawn(
            provider.clone() as Arc<dyn ProviderEffects>,
            clock.clone() as Arc<dyn ClockEffects>,
        );
        handle.set_session(viewer).await.unwrap();
        Harness {
            provider,
            clock,
            handle,
            viewer,
        }
    }

    #[tokio::test]
    async fn message_events_maintain_last_message_and_chat_order() {
        let h = harness().await;
        let chat_a = fixtures::chat().created_at(1_000).participant(h.viewer);
        let chat_b = fixtures::chat().created_at(2_000).participant(h.viewer);
        let (a, b) = (chat_a.id(), chat_b.id());
        h.handle
            .replace_chats(vec![chat_a.row(), chat_b.row()])
            .unwrap();

        h.handle.replace_messages(a, Vec::new()).unwrap();
        h.handle.replace_messages(b, Vec::new()).unwrap();
        settle().await;

        // Newer chat leads while neither has messages.
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.chats[0].id, b);

        // A message in the older chat moves it to the front.
        let message = fixtures::message(a).created_at(5_000);
        h.handle
            .apply_message_event(a, message.insert_event())
            .unwrap();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.chats[0].id, a);
        let last = snapshot.chat(a).unwrap().last_message.as_ref().unwrap();
        assert_eq!(last.created_at, Timestamp::from_millis(5_000));
        assert!(snapshot.chat(a).unwrap().unread, "new message is unread");
    }

    #[tokio::test]
    async fn deleting_the_last_message_rescans_the_thread() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();

        let first = fixtures::message(id).created_at(2_000);
        let second = fixtures::message(id).created_at(3_000);
        let second_id = second.id();
        h.handle
            .replace_messages(id, vec![first.row(), second.row()])
            .unwrap();
        settle().await;
        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.chat(id).unwrap().last_message.as_ref().unwrap().id,
            second_id
        );

        h.handle
            .apply_message_event(id, fixtures::delete_event(Table::Messages, second_id.as_uuid()))
            .unwrap();
        settle().await;
        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.chat(id).unwrap().last_message.as_ref().unwrap().id,
            first.id(),
            "last message falls back to the remaining maximum"
        );

        h.handle
            .apply_message_event(id, fixtures::delete_event(Table::Messages, first.id().as_uuid()))
            .unwrap();
        settle().await;
        let snapshot = h.handle.snapshot();
        assert!(snapshot.chat(id).unwrap().last_message.is_none());
    }

    #[tokio::test]
    async fn send_message_rolls_back_when_the_request_fails() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        h.handle.replace_messages(id, Vec::new()).unwrap();

        h.provider.fail_next_inserts(1);
        let err = h
            .handle
            .send_message(id, "won't make it".to_string())
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::Request { .. });

        settle().await;
        let snapshot = h.handle.snapshot();
        assert!(snapshot.thread(id).is_empty(), "optimistic insert undone");
        assert!(snapshot.chat(id).unwrap().last_message.is_none());
    }

    #[tokio::test]
    async fn send_message_confirms_and_keeps_the_thread() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        h.handle.replace_messages(id, Vec::new()).unwrap();

        h.clock.advance(500);
        h.handle.send_message(id, "hello".to_string()).await.unwrap();

        settle().await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.thread(id).len(), 1);
        assert_eq!(snapshot.thread(id)[0].content, "hello");
        assert_eq!(snapshot.thread(id)[0].sender_id, h.viewer);
        assert_eq!(
            snapshot.chat(id).unwrap().last_message.as_ref().unwrap().content,
            "hello"
        );
    }

    #[tokio::test]
    async fn mark_read_clears_unread_immediately_and_survives_write_failure() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        let message = fixtures::message(id).created_at(9_000);
        h.handle.replace_messages(id, vec![message.row()]).unwrap();
        settle().await;
        assert!(h.handle.snapshot().chat(id).unwrap().unread);

        // Watermark write fails; the flag must stay cleared regardless.
        h.provider.fail_next_updates(1);
        h.handle.mark_read(id).await.unwrap();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert!(!snapshot.chat(id).unwrap().unread);
        assert_eq!(
            snapshot.chat(id).unwrap().last_read_at,
            Some(Timestamp::from_millis(10_000))
        );
    }

    #[tokio::test]
    async fn bulk_replace_with_stale_rows_keeps_the_watermark() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        let message = fixtures::message(id).created_at(5_000);
        h.handle.replace_messages(id, vec![message.row()]).unwrap();
        h.handle.mark_read(id).await.unwrap();
        settle().await;

        // A full read built before the mark-read write landed: its chat
        // row carries no watermark at all.
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        settle().await;
        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.chat(id).unwrap().last_read_at,
            Some(Timestamp::from_millis(10_000))
        );
        assert!(!snapshot.chat(id).unwrap().unread, "read chat stayed read");

        // A genuinely newer server watermark still wins over the held one.
        h.handle
            .replace_chats(vec![chat.clone().last_read_at(20_000).row()])
            .unwrap();
        settle().await;
        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.chat(id).unwrap().last_read_at,
            Some(Timestamp::from_millis(20_000))
        );
    }

    #[tokio::test]
    async fn hydrated_chat_rows_cannot_regress_the_watermark() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        let message = fixtures::message(id).created_at(5_000);
        h.handle.replace_messages(id, vec![message.row()]).unwrap();
        h.handle.mark_read(id).await.unwrap();
        settle().await;

        // A point read raced the mark-read write; its row has no watermark.
        h.handle.hydrated_chat(chat.row()).unwrap();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.chat(id).unwrap().last_read_at,
            Some(Timestamp::from_millis(10_000))
        );
        assert!(!snapshot.chat(id).unwrap().unread, "read chat stayed read");
    }

    #[tokio::test]
    async fn participant_delete_drops_the_chat_and_its_thread() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        let viewer_row = chat.participant_row_id(h.viewer).unwrap();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        h.handle.replace_messages(id, Vec::new()).unwrap();
        settle().await;

        h.handle
            .apply_participant_event(fixtures::delete_event(Table::Participants, viewer_row))
            .unwrap();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert!(snapshot.chats.is_empty());
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn watermark_echo_from_another_device_clears_unread() {
        let h = harness().await;
        let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
        let id = chat.id();
        let viewer_row = chat.participant_row_id(h.viewer).unwrap();
        h.handle.replace_chats(vec![chat.row()]).unwrap();
        let message = fixtures::message(id).created_at(9_000);
        h.handle.replace_messages(id, vec![message.row()]).unwrap();
        settle().await;
        assert!(h.handle.snapshot().chat(id).unwrap().unread);

        let mut payload = Row::new();
        payload.insert("last_read_at".to_string(), Value::from(9_500u64));
        let event = ChangeEvent::new(
            Table::Participants,
            ChangeOp::Update,
            viewer_row,
            payload,
            Timestamp::from_millis(9_500),
        );
        h.handle.apply_participant_event(event).unwrap();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert!(!snapshot.chat(id).unwrap().unread);
        assert_eq!(
            snapshot.chat(id).unwrap().last_read_at,
            Some(Timestamp::from_millis(9_500))
        );
    }

    // Arbitrary event streams over a small message pool: the chat summary
    // must always point at the surviving message with the greatest
    // `created_at` (ids break ties), or at nothing once the thread is empty.
    proptest! {
        #[test]
        fn last_message_is_the_newest_surviving_message(
            steps in proptest::collection::vec((0u8..4, 0u8..3, 1u64..50_000), 1..30)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async move {
                let h = harness().await;
                let chat = fixtures::chat().created_at(1_000).participant(h.viewer);
                let id = chat.id();
                h.handle.replace_chats(vec![chat.row()]).unwrap();
                h.handle.replace_messages(id, Vec::new()).unwrap();

                let pool: Vec<_> = (0..4).map(|_| fixtures::message(id)).collect();
                let mut model: HashMap<MessageId, u64> = HashMap::new();
                for (which, op, millis) in steps {
                    let fixture = &pool[which as usize];
                    let event = match op {
                        0 => {
                            model.insert(fixture.id(), millis);
                            fixture.clone().created_at(millis).insert_event()
                        }
                        1 => {
                            // Updates of unknown messages are skipped no-ops.
                            if model.contains_key(&fixture.id()) {
                                model.insert(fixture.id(), millis);
                            }
                            let mut patch = Row::new();
                            patch.insert("created_at".to_string(), Value::from(millis));
                            ChangeEvent::new(
                                Table::Messages,
                                ChangeOp::Update,
                                fixture.id().as_uuid(),
                                patch,
                                Timestamp::from_millis(millis),
                            )
                        }
                        _ => {
                            model.remove(&fixture.id());
                            fixtures::delete_event(Table::Messages, fixture.id().as_uuid())
                        }
                    };
                    h.handle.apply_message_event(id, event).unwrap();
                }
                settle().await;

                let expected = model
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                    .map(|(id, millis)| (*id, Timestamp::from_millis(*millis)));
                let snapshot = h.handle.snapshot();
                let last = snapshot
                    .chat(id)
                    .and_then(|c| c.last_message.as_ref())
                    .map(|m| (m.id, m.created_at));
                prop_assert_eq!(last, expected);
                Ok(())
            })?;
        }
    }
}
