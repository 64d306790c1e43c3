//! Notification reconciliation.
//!
//! Notifications are the simplest collection: ordered by `created_at`
//! descending, one unread counter derived by counting, and a single
//! mutation — marking one read — that is pure optimistic: the flag flips
//! immediately and never rolls back, a failed write being corrected by the
//! next mark or resync.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use veranda_core::{
    ChangeEvent, ClockEffects, MutationId, Notification, NotificationId, ProviderEffects,
    ProviderError, Row, Table, UserId,
};

use crate::error::{Result, SyncError};
use crate::optimistic::{
    spawn_write, EchoKey, MutationKind, MutationTarget, PendingLedger, PendingMutation,
    ProviderWrite, QueuedMutation, Settlement, UndoOp,
};
use crate::read_state;
use crate::reconcile::{Ordered, Record, RecordStore};

impl Record for Notification {
    type Id = NotificationId;

    fn record_id(&self) -> NotificationId {
        self.id
    }

    fn id_from_uuid(id: Uuid) -> NotificationId {
        NotificationId::from_uuid(id)
    }
}

impl Ordered for Notification {
    fn order_cmp(a: &Self, b: &Self) -> Ordering {
        b.created_at.cmp(&a.created_at)
    }

    fn order_changed(before: &Self, after: &Self) -> bool {
        before.created_at != after.created_at
    }
}

/// Point-in-time view of the notification list.
#[derive(Debug, Clone, Default)]
pub struct NotificationsSnapshot {
    /// Notifications, newest first.
    pub notifications: Vec<Notification>,
}

impl NotificationsSnapshot {
    /// Look up a notification by id.
    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }

    /// Number of unread notifications.
    pub fn unread_count(&self) -> usize {
        read_state::unread_notifications(&self.notifications)
    }
}

#[derive(Debug)]
enum NotificationAction {
    MarkRead { id: NotificationId },
}

#[derive(Debug)]
pub(crate) enum NotificationsCommand {
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
    MarkRead {
        id: NotificationId,
        ack: oneshot::Sender<Result<()>>,
    },
    RequestSettled {
        target: MutationTarget,
        mutation_id: MutationId,
        result: std::result::Result<Option<Row>, ProviderError>,
    },
}

/// Cheap cloneable handle to the notifications reconciler.
#[derive(Debug, Clone)]
pub(crate) struct NotificationsHandle {
    commands: mpsc::UnboundedSender<NotificationsCommand>,
    snapshot: watch::Receiver<Arc<NotificationsSnapshot>>,
}

impl NotificationsHandle {
    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<NotificationsSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<Arc<NotificationsSnapshot>> {
        self.snapshot.clone()
    }

    pub fn apply_event(&self, event: ChangeEvent) -> Result<()> {
        self.send(NotificationsCommand::Event(event))
    }

    pub fn replace(&self, rows: Vec<Row>) -> Result<()> {
        self.send(NotificationsCommand::Replace(rows))
    }

    pub async fn set_session(&self, viewer: UserId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(NotificationsCommand::SetSession { viewer, ack })?;
        done.await.map_err(|_| closed())
    }

    pub async fn clear(&self, error: SyncError) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(NotificationsCommand::Clear { error, ack })?;
        done.await.map_err(|_| closed())
    }

    /// Mark one notification read; resolves once the flag has flipped.
    pub async fn mark_read(&self, id: NotificationId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(NotificationsCommand::MarkRead { id, ack })?;
        done.await.map_err(|_| closed())?
    }

    fn send(&self, command: NotificationsCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> SyncError {
    SyncError::engine("notifications reconciler is gone")
}

/// Start the notifications reconciler.
pub(crate) fn spawn(
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
) -> (NotificationsHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::unbounded_channel();
    let (publish, snapshot) = watch::channel(Arc::new(NotificationsSnapshot::default()));
    let reconciler = NotificationsReconciler {
        provider,
        clock,
        commands: commands.clone(),
        viewer: None,
        store: RecordStore::new(),
        ledger: PendingLedger::new(),
        publish,
    };
    let task = tokio::spawn(reconciler.run(inbox));
    (NotificationsHandle { commands, snapshot }, task)
}

struct NotificationsReconciler {
    provider: Arc<dyn ProviderEffects>,
    clock: Arc<dyn ClockEffects>,
    commands: mpsc::UnboundedSender<NotificationsCommand>,
    viewer: Option<UserId>,
    store: RecordStore<Notification>,
    ledger: PendingLedger<NotificationAction>,
    publish: watch::Sender<Arc<NotificationsSnapshot>>,
}

impl NotificationsReconciler {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<NotificationsCommand>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
            self.publish();
        }
    }

    fn handle(&mut self, command: NotificationsCommand) {
        match command {
            NotificationsCommand::SetSession { viewer, ack } => {
                self.reset(SyncError::no_session("session changed"));
                self.viewer = Some(viewer);
                let _ = ack.send(());
            }
            NotificationsCommand::Clear { error, ack } => {
                self.reset(error);
                self.viewer = None;
                let _ = ack.send(());
            }
            NotificationsCommand::Event(event) => {
                if let Err(error) = self.store.apply_event(&event) {
                    warn!(error = %error, "notification event skipped");
                }
                self.confirm(EchoKey::Notification(NotificationId::from_uuid(
                    event.entity_id,
                )));
            }
            NotificationsCommand::Replace(rows) => {
                let outcome = self.store.apply_bulk_replace(&rows);
                debug!(
                    inserted = outcome.inserted,
                    merged = outcome.merged,
                    removed = outcome.removed,
                    "notifications replaced"
                );
            }
            NotificationsCommand::MarkRead { id, ack } => self.on_mark_read(id, ack),
            NotificationsCommand::RequestSettled {
                target,
                mutation_id,
                result,
            } => self.on_settled(target, mutation_id, result),
        }
    }

    fn reset(&mut self, error: SyncError) {
        let flushed = self.ledger.fail_all(&error);
        if flushed > 0 {
            debug!(flushed = flushed, "flushed pending notification mutations");
        }
        self.store.clear();
    }

    fn on_mark_read(&mut self, id: NotificationId, ack: oneshot::Sender<Result<()>>) {
        if self.viewer.is_none() {
            let _ = ack.send(Err(SyncError::no_session("mark_notification_read")));
            return;
        }
        let mut flipped = false;
        let found = self.store.update_with(id, |record| {
            flipped = read_state::mark_notification_read(record);
            false
        });
        if !found {
            let _ = ack.send(Err(SyncError::request(format!(
                "notification {id} is not in the list"
            ))));
            return;
        }
        let _ = ack.send(Ok(()));
        if !flipped {
            return;
        }
        let target = MutationTarget::Notification(id);
        if self.ledger.is_busy(target) {
            self.ledger.enqueue(
                target,
                QueuedMutation {
                    action: NotificationAction::MarkRead { id },
                    reply: None,
                },
            );
        } else {
            self.start_mark_read_write(id);
        }
    }

    fn start_mark_read_write(&mut self, id: NotificationId) {
        let mut patch = Row::new();
        patch.insert("read".to_string(), Value::Bool(true));

        let pending = PendingMutation::new(
            MutationKind::MarkRead,
            MutationTarget::Notification(id),
            EchoKey::Notification(id),
            UndoOp::None,
            None,
            self.clock.now(),
        );
        let mutation_id = pending.id;
        self.ledger.begin(pending);
        spawn_write(
            self.provider.clone(),
            self.commands.clone(),
            MutationTarget::Notification(id),
            mutation_id,
            ProviderWrite::Update {
                table: Table::Notifications,
                entity: id.as_uuid(),
                patch,
            },
            |target, mutation_id, result| NotificationsCommand::RequestSettled {
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
                debug!(kind = %kind, target = %target, "mutation confirmed by request");
                self.start_next(next);
            }
            Settlement::RolledBack {
                kind,
                target,
                error,
                next,
                ..
            } => {
                // Read marks keep their local effect; the write retries on
                // the next mark or resync.
                warn!(kind = %kind, target = %target, error = %error, "read-mark write failed");
                self.start_next(next);
            }
            Settlement::Stale { result } => {
                if let Err(error) = result {
                    debug!(target = %target, error = %error, "late failure ignored; state follows the echo");
                }
            }
        }
    }

    fn start_next(&mut self, next: Option<QueuedMutation<NotificationAction>>) {
        if let Some(queued) = next {
            match queued.action {
                NotificationAction::MarkRead { id } => self.start_mark_read_write(id),
            }
        }
    }

    fn confirm(&mut self, key: EchoKey) {
        if let Some(resolution) = self.ledger.confirm_echo(key) {
            debug!(kind = %resolution.kind, target = %resolution.target, "mutation confirmed by echo");
            self.start_next(resolution.next);
        }
    }

    fn publish(&self) {
        let snapshot = NotificationsSnapshot {
            notifications: self.store.snapshot(),
        };
        let _ = self.publish.send(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use veranda_testkit::{fixtures, InMemoryProvider, TestClock};

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn harness() -> (Arc<InMemoryProvider>, NotificationsHandle, UserId) {
        let provider = Arc::new(InMemoryProvider::new());
        let clock = Arc::new(TestClock::new());
        let viewer = UserId::new();
        let (handle, _task) = spawn(
            provider.clone() as Arc<dyn ProviderEffects>,
            clock as Arc<dyn ClockEffects>,
        );
        handle.set_session(viewer).await.unwrap();
        (provider, handle, viewer)
    }

    #[tokio::test]
    async fn events_arrive_newest_first_and_count_unread() {
        let (_provider, handle, viewer) = harness().await;
        let older = fixtures::notification(viewer).created_at(1_000);
        let newer = fixtures::notification(viewer).created_at(2_000);
        handle.apply_event(older.insert_event()).unwrap();
        handle.apply_event(newer.insert_event()).unwrap();
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.notifications.len(), 2);
        assert_eq!(snapshot.notifications[0].id, newer.id());
        assert_eq!(snapshot.unread_count(), 2);
    }

    #[tokio::test]
    async fn redelivered_insert_counts_once() {
        let (_provider, handle, viewer) = harness().await;
        let one = fixtures::notification(viewer).created_at(1_000);
        handle.apply_event(one.insert_event()).unwrap();
        handle.apply_event(one.insert_event()).unwrap();
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.unread_count(), 1);
    }

    #[tokio::test]
    async fn mark_read_flips_immediately_and_survives_write_failure() {
        let (provider, handle, viewer) = harness().await;
        let one = fixtures::notification(viewer).created_at(1_000);
        handle.apply_event(one.insert_event()).unwrap();
        settle().await;

        provider.fail_next_updates(1);
        handle.mark_read(one.id()).await.unwrap();
        settle().await;

        let snapshot = handle.snapshot();
        assert!(snapshot.get(one.id()).unwrap().read);
        assert_eq!(snapshot.unread_count(), 0);

        // Marking again is a no-op and issues no second write.
        handle.mark_read(one.id()).await.unwrap();
        settle().await;
        assert_eq!(provider.update_attempts(), 1);
    }

    #[tokio::test]
    async fn unknown_notification_cannot_be_marked() {
        let (_provider, handle, _viewer) = harness().await;
        let err = handle.mark_read(NotificationId::new()).await.unwrap_err();
        assert_matches!(err, SyncError::Request { .. });
    }
}
