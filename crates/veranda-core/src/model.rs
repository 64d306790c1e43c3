//! Domain records held by the reconcilers.
//!
//! These types decode directly from provider rows. Fields the provider does
//! not send (derived flags, locally-maintained embeds) default so a partial
//! row still decodes; the reconcilers recompute them after every merge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ChatId, MessageId, NotificationId, PostId, UserId};
use crate::time::Timestamp;

// ─────────────────────────────────────────────────────────────────────────────
// Chats & messages
// ─────────────────────────────────────────────────────────────────────────────

/// A message inside a chat. Immutable once created except for `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique across all chats.
    pub id: MessageId,
    /// The chat this message belongs to.
    pub chat_id: ChatId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Server-assigned creation time.
    pub created_at: Timestamp,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub is_read: bool,
}

/// A participant reference embedded on a [`Chat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRef {
    /// The participant row id (the write target for read watermarks).
    pub id: Uuid,
    /// The user this participant row belongs to.
    pub user_id: UserId,
}

/// A full chat-participant row as delivered on the participants scope.
///
/// One row exists per (chat, user); `last_read_at` is that user's read
/// watermark for the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParticipant {
    /// Row id.
    pub id: Uuid,
    /// Chat the row belongs to.
    pub chat_id: ChatId,
    /// User the row belongs to.
    pub user_id: UserId,
    /// Read watermark; absent until the user first marks the chat read.
    #[serde(default)]
    pub last_read_at: Option<Timestamp>,
}

/// A direct-message chat in the signed-in user's chat list.
///
/// `last_message` and `unread` are derived: the reconciler recomputes them
/// on every relevant mutation, and nothing else may set them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id.
    pub id: ChatId,
    /// Server-assigned creation time.
    pub created_at: Timestamp,
    /// Whether this is a group chat.
    #[serde(default)]
    pub is_group: bool,
    /// Participant references, including the viewer's own row.
    #[serde(default)]
    pub participants: Vec<ParticipantRef>,
    /// The newest message still present in the chat, if any.
    #[serde(default)]
    pub last_message: Option<Message>,
    /// The viewer's read watermark for this chat.
    #[serde(default)]
    pub last_read_at: Option<Timestamp>,
    /// Derived: whether the chat has activity newer than the watermark.
    #[serde(default)]
    pub unread: bool,
}

impl Chat {
    /// Recompute the `unread` flag from `last_message` and `last_read_at`.
    ///
    /// A chat is unread exactly when its newest message is newer than the
    /// watermark, or when there is a message but no watermark at all. A chat
    /// with no messages is never unread.
    pub fn refresh_unread(&mut self) {
        self.unread = match (&self.last_message, self.last_read_at) {
            (Some(message), Some(watermark)) => message.created_at > watermark,
            (Some(_), None) => true,
            (None, _) => false,
        };
    }

    /// The viewer's own participant reference, if known.
    pub fn participant_for(&self, user: UserId) -> Option<&ParticipantRef> {
        self.participants.iter().find(|p| p.user_id == user)
    }

    /// Whether any embedded participant row has the given row id.
    pub fn has_participant_row(&self, participant_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.id == participant_id)
    }

    /// Sort key for the chat list: newest activity first.
    ///
    /// Chats with messages sort by their last message's creation time;
    /// chats without messages fall back to their own creation time and sort
    /// after every chat that has one.
    pub fn activity_key(&self) -> Option<Timestamp> {
        self.last_message.as_ref().map(|m| m.created_at)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// What produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Someone liked the recipient's post.
    Like,
    /// Someone followed the recipient.
    Follow,
    /// Someone commented on the recipient's post.
    Comment,
    /// Someone mentioned the recipient.
    Mention,
    /// Someone sent a friend request.
    FriendRequest,
}

impl NotificationKind {
    /// Stable string form used in rows and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Follow => "follow",
            Self::Comment => "comment",
            Self::Mention => "mention",
            Self::FriendRequest => "friend_request",
        }
    }
}

/// A notification created server-side; the client only reads, marks read,
/// and counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Row id.
    pub id: NotificationId,
    /// The user this notification is addressed to.
    pub recipient_id: UserId,
    /// What produced it.
    pub kind: NotificationKind,
    /// The entity that triggered it (post, comment, user), if any.
    #[serde(default)]
    pub source_ref: Option<Uuid>,
    /// Server-assigned creation time.
    pub created_at: Timestamp,
    /// Whether the recipient has seen it.
    #[serde(default)]
    pub read: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Feed
// ─────────────────────────────────────────────────────────────────────────────

/// A post in the ranked content feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPost {
    /// Post id.
    pub id: PostId,
    /// Author.
    pub author_id: UserId,
    /// Post body.
    pub content: String,
    /// Attached image reference, if any.
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Server-assigned creation time.
    pub created_at: Timestamp,
    /// Total views.
    #[serde(default)]
    pub view_count: u64,
    /// Total likes.
    #[serde(default)]
    pub like_count: u64,
    /// Total comments.
    #[serde(default)]
    pub comment_count: u64,
    /// Whether the viewer has liked this post.
    #[serde(default)]
    pub viewer_has_liked: bool,
    /// Whether the viewer has reposted this post.
    #[serde(default)]
    pub viewer_has_reposted: bool,
    /// Derived engagement score; the feed's primary sort key.
    #[serde(default)]
    pub rank_score: f64,
}
