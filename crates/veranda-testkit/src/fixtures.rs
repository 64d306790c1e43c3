//! Row and event builders for the four synchronized collections.
//!
//! Each builder holds a fully formed record, exposes chainable setters for
//! the fields tests care about, and hands out the same data in whichever
//! shape a test needs: the typed record, the provider row, or an insert
//! event carrying that row.

use serde_json::Value;
use uuid::Uuid;
use veranda_core::{
    encode_row, like_row_id, repost_row_id, ChangeEvent, ChangeOp, Chat, ChatId, ChatParticipant,
    FeedPost, Message, MessageId, Notification, NotificationId, NotificationKind, ParticipantRef,
    PostId, Row, Table, Timestamp, UserId,
};

/// A feed post with zeroed counters created at t=1000.
pub fn post() -> PostFixture {
    PostFixture {
        post: FeedPost {
            id: PostId::new(),
            author_id: UserId::new(),
            content: "fixture post".to_string(),
            image_ref: None,
            created_at: Timestamp::from_millis(1_000),
            view_count: 0,
            like_count: 0,
            comment_count: 0,
            viewer_has_liked: false,
            viewer_has_reposted: false,
            rank_score: 0.0,
        },
    }
}

/// An empty direct chat created at t=1000. Add participants before use.
pub fn chat() -> ChatFixture {
    ChatFixture {
        chat: Chat {
            id: ChatId::new(),
            created_at: Timestamp::from_millis(1_000),
            is_group: false,
            participants: Vec::new(),
            last_message: None,
            last_read_at: None,
            unread: false,
        },
    }
}

/// An unread message in `chat` from a fresh sender, created at t=1000.
pub fn message(chat: ChatId) -> MessageFixture {
    MessageFixture {
        message: Message {
            id: MessageId::new(),
            chat_id: chat,
            sender_id: UserId::new(),
            content: "hi there".to_string(),
            created_at: Timestamp::from_millis(1_000),
            is_read: false,
        },
    }
}

/// An unread like notification for `recipient`, created at t=1000.
pub fn notification(recipient: UserId) -> NotificationFixture {
    NotificationFixture {
        notification: Notification {
            id: NotificationId::new(),
            recipient_id: recipient,
            kind: NotificationKind::Like,
            source_ref: None,
            created_at: Timestamp::from_millis(1_000),
            read: false,
        },
    }
}

/// A delete event with an empty payload, the way thin provider callbacks
/// deliver removals.
pub fn delete_event(table: Table, entity: Uuid) -> ChangeEvent {
    ChangeEvent::new(table, ChangeOp::Delete, entity, Row::new(), Timestamp::ZERO)
}

/// The `likes` row the engine writes when `user` likes `post`, under its
/// deterministic row id.
pub fn like_row(post: PostId, user: UserId) -> Row {
    interaction_row(like_row_id(post, user), post, user)
}

/// The `reposts` row the engine writes when `user` reposts `post`.
pub fn repost_row(post: PostId, user: UserId) -> Row {
    interaction_row(repost_row_id(post, user), post, user)
}

fn interaction_row(id: Uuid, post: PostId, user: UserId) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), Value::String(id.to_string()));
    row.insert("post_id".to_string(), Value::String(post.to_string()));
    row.insert("user_id".to_string(), Value::String(user.to_string()));
    row
}

// ─────────────────────────────────────────────────────────────────────────────
// Posts
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`FeedPost`] row.
#[derive(Debug, Clone)]
pub struct PostFixture {
    post: FeedPost,
}

impl PostFixture {
    /// Sets the creation time in milliseconds.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.post.created_at = Timestamp::from_millis(millis);
        self
    }

    /// Sets like, comment, and view counters in one go.
    pub fn counts(mut self, likes: u64, comments: u64, views: u64) -> Self {
        self.post.like_count = likes;
        self.post.comment_count = comments;
        self.post.view_count = views;
        self
    }

    /// Sets the author.
    pub fn author(mut self, author: UserId) -> Self {
        self.post.author_id = author;
        self
    }

    /// Marks the post as already liked by the viewer.
    pub fn liked_by_viewer(mut self) -> Self {
        self.post.viewer_has_liked = true;
        self
    }

    /// The post id.
    pub fn id(&self) -> PostId {
        self.post.id
    }

    /// The typed record.
    pub fn record(&self) -> FeedPost {
        self.post.clone()
    }

    /// The provider row.
    pub fn row(&self) -> Row {
        encode_row(&self.post).expect("post fixture encodes")
    }

    /// An insert event carrying the row.
    pub fn insert_event(&self) -> ChangeEvent {
        ChangeEvent::new(
            Table::Posts,
            ChangeOp::Insert,
            self.post.id.as_uuid(),
            self.row(),
            self.post.created_at,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chats
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`Chat`] row and its participant rows.
#[derive(Debug, Clone)]
pub struct ChatFixture {
    chat: Chat,
}

impl ChatFixture {
    /// Sets the creation time in milliseconds.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.chat.created_at = Timestamp::from_millis(millis);
        self
    }

    /// Marks the chat as a group chat.
    pub fn group(mut self) -> Self {
        self.chat.is_group = true;
        self
    }

    /// Adds a participant row for `user` with a fresh row id.
    pub fn participant(mut self, user: UserId) -> Self {
        self.chat.participants.push(ParticipantRef {
            id: Uuid::new_v4(),
            user_id: user,
        });
        self
    }

    /// Sets the viewer's read watermark.
    pub fn last_read_at(mut self, millis: u64) -> Self {
        self.chat.last_read_at = Some(Timestamp::from_millis(millis));
        self
    }

    /// Embeds a last message, the way denormalized chat rows carry one.
    pub fn last_message(mut self, message: Message) -> Self {
        self.chat.last_message = Some(message);
        self
    }

    /// The chat id.
    pub fn id(&self) -> ChatId {
        self.chat.id
    }

    /// The typed record.
    pub fn record(&self) -> Chat {
        self.chat.clone()
    }

    /// The chat row, participants embedded.
    pub fn row(&self) -> Row {
        encode_row(&self.chat).expect("chat fixture encodes")
    }

    /// The participant row id for `user`, if they were added.
    pub fn participant_row_id(&self, user: UserId) -> Option<Uuid> {
        self.chat.participant_for(user).map(|p| p.id)
    }

    /// The standalone participant row for `user`, as the participants scope
    /// delivers it.
    pub fn participant_row(&self, user: UserId) -> Option<Row> {
        let participant = self.chat.participant_for(user)?;
        let row = ChatParticipant {
            id: participant.id,
            chat_id: self.chat.id,
            user_id: user,
            last_read_at: self.chat.last_read_at,
        };
        Some(encode_row(&row).expect("participant fixture encodes"))
    }

    /// An insert event for `user`'s participant row.
    pub fn participant_insert_event(&self, user: UserId) -> Option<ChangeEvent> {
        let id = self.participant_row_id(user)?;
        let row = self.participant_row(user)?;
        Some(ChangeEvent::new(
            Table::Participants,
            ChangeOp::Insert,
            id,
            row,
            self.chat.created_at,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`Message`] row.
#[derive(Debug, Clone)]
pub struct MessageFixture {
    message: Message,
}

impl MessageFixture {
    /// Sets the creation time in milliseconds.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.message.created_at = Timestamp::from_millis(millis);
        self
    }

    /// Sets the sender.
    pub fn sender(mut self, sender: UserId) -> Self {
        self.message.sender_id = sender;
        self
    }

    /// Sets the body.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.message.content = content.into();
        self
    }

    /// The message id.
    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// The typed record.
    pub fn record(&self) -> Message {
        self.message.clone()
    }

    /// The provider row.
    pub fn row(&self) -> Row {
        encode_row(&self.message).expect("message fixture encodes")
    }

    /// An insert event carrying the row.
    pub fn insert_event(&self) -> ChangeEvent {
        ChangeEvent::new(
            Table::Messages,
            ChangeOp::Insert,
            self.message.id.as_uuid(),
            self.row(),
            self.message.created_at,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`Notification`] row.
#[derive(Debug, Clone)]
pub struct NotificationFixture {
    notification: Notification,
}

impl NotificationFixture {
    /// Sets the creation time in milliseconds.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.notification.created_at = Timestamp::from_millis(millis);
        self
    }

    /// Sets the kind.
    pub fn kind(mut self, kind: NotificationKind) -> Self {
        self.notification.kind = kind;
        self
    }

    /// Sets the triggering entity.
    pub fn source(mut self, source: Uuid) -> Self {
        self.notification.source_ref = Some(source);
        self
    }

    /// Marks the notification as already read.
    pub fn read(mut self) -> Self {
        self.notification.read = true;
        self
    }

    /// The notification id.
    pub fn id(&self) -> NotificationId {
        self.notification.id
    }

    /// The typed record.
    pub fn record(&self) -> Notification {
        self.notification.clone()
    }

    /// The provider row.
    pub fn row(&self) -> Row {
        encode_row(&self.notification).expect("notification fixture encodes")
    }

    /// An insert event carrying the row.
    pub fn insert_event(&self) -> ChangeEvent {
        ChangeEvent::new(
            Table::Notifications,
            ChangeOp::Insert,
            self.notification.id.as_uuid(),
            self.row(),
            self.notification.created_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veranda_core::decode_row;

    #[test]
    fn chat_fixture_links_participant_rows_to_the_embed() {
        let viewer = UserId::new();
        let fixture = chat().created_at(2_000).participant(viewer);

        let typed: Chat = decode_row(&fixture.row()).unwrap();
        let embedded = typed.participant_for(viewer).unwrap();
        assert_eq!(Some(embedded.id), fixture.participant_row_id(viewer));

        let standalone: ChatParticipant =
            decode_row(&fixture.participant_row(viewer).unwrap()).unwrap();
        assert_eq!(standalone.id, embedded.id);
        assert_eq!(standalone.chat_id, fixture.id());
        assert_eq!(standalone.user_id, viewer);
    }

    #[test]
    fn post_fixture_rows_decode_back() {
        let fixture = post().created_at(3_000).counts(4, 2, 8);
        let typed: FeedPost = decode_row(&fixture.row()).unwrap();
        assert_eq!(typed.id, fixture.id());
        assert_eq!(
            (typed.like_count, typed.comment_count, typed.view_count),
            (4, 2, 8)
        );
        assert_eq!(typed.created_at, Timestamp::from_millis(3_000));
    }

    #[test]
    fn insert_events_carry_the_entity_id() {
        let recipient = UserId::new();
        let fixture = notification(recipient).created_at(5_000);
        let event = fixture.insert_event();
        assert_eq!(event.entity_id, fixture.id().as_uuid());
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.payload_uuid("recipient_id"), Some(recipient.as_uuid()));
    }
}
