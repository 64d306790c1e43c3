//! Read-state bookkeeping: watermarks, read flags, unread counters.
//!
//! Chat read state is a per-chat timestamp watermark; notification read
//! state is a per-row boolean. Both are applied purely optimistically — a
//! failed write is only logged, and the next mark-read retries it, since
//! staleness here is low-risk. The two unread counters are independent and
//! never combined.

use veranda_core::{Chat, Notification, Timestamp};

/// Advance a chat's read watermark to `now` and refresh its unread flag.
///
/// The watermark only moves forward; marking an already-read chat with an
/// older clock is a no-op. Returns whether anything changed, so callers can
/// skip the provider write when nothing did.
pub fn mark_chat_read(chat: &mut Chat, now: Timestamp) -> bool {
    if chat.last_read_at.is_some_and(|at| at >= now) {
        return false;
    }
    chat.last_read_at = Some(now);
    chat.refresh_unread();
    true
}

/// Apply a watermark delivered by the provider (own write echoed back, or
/// another device's mark-read).
///
/// Forward-only, same as the local path.
pub fn apply_watermark(chat: &mut Chat, at: Timestamp) -> bool {
    if chat.last_read_at.is_some_and(|existing| existing >= at) {
        return false;
    }
    chat.last_read_at = Some(at);
    chat.refresh_unread();
    true
}

/// Mark a notification read. Returns whether it changed.
pub fn mark_notification_read(notification: &mut Notification) -> bool {
    if notification.read {
        return false;
    }
    notification.read = true;
    true
}

/// Number of chats with activity newer than their watermark.
pub fn unread_chats(chats: &[Chat]) -> usize {
    chats.iter().filter(|c| c.unread).count()
}

/// Number of unread notifications.
pub fn unread_notifications(notifications: &[Notification]) -> usize {
    notifications.iter().filter(|n| !n.read).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veranda_core::{ChatId, Message, MessageId, NotificationId, NotificationKind, UserId};

    fn message_at(chat: ChatId, at: u64) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: chat,
            sender_id: UserId::new(),
            content: "m".to_string(),
            created_at: Timestamp::from_millis(at),
            is_read: false,
        }
    }

    fn chat_with_message_at(at: u64) -> Chat {
        let id = ChatId::new();
        let mut chat = Chat {
            id,
            created_at: Timestamp::from_millis(1),
            is_group: false,
            participants: Vec::new(),
            last_message: Some(message_at(id, at)),
            last_read_at: None,
            unread: false,
        };
        chat.refresh_unread();
        chat
    }

    #[test]
    fn mark_read_clears_unread_until_newer_activity() {
        let t = 1_000u64;

        // lastReadAt = T-1, messages at T and T+1.
        let mut chat = chat_with_message_at(t + 1);
        apply_watermark(&mut chat, Timestamp::from_millis(t - 1));
        assert!(chat.unread);

        // markChatRead at T+2.
        assert!(mark_chat_read(&mut chat, Timestamp::from_millis(t + 2)));
        assert!(!chat.unread);

        // New message at T+3 flips it back.
        chat.last_message = Some(message_at(chat.id, t + 3));
        chat.refresh_unread();
        assert!(chat.unread);
    }

    #[test]
    fn watermark_never_moves_backward() {
        let mut chat = chat_with_message_at(500);
        assert!(mark_chat_read(&mut chat, Timestamp::from_millis(600)));
        assert!(!mark_chat_read(&mut chat, Timestamp::from_millis(400)));
        assert_eq!(chat.last_read_at, Some(Timestamp::from_millis(600)));

        assert!(!apply_watermark(&mut chat, Timestamp::from_millis(550)));
        assert!(apply_watermark(&mut chat, Timestamp::from_millis(700)));
    }

    #[test]
    fn counters_are_independent() {
        let unread_chat = chat_with_message_at(100);
        let mut read_chat = chat_with_message_at(100);
        apply_watermark(&mut read_chat, Timestamp::from_millis(200));

        let chats = vec![unread_chat, read_chat];
        assert_eq!(unread_chats(&chats), 1);

        let mut n1 = Notification {
            id: NotificationId::new(),
            recipient_id: UserId::new(),
            kind: NotificationKind::Like,
            source_ref: None,
            created_at: Timestamp::from_millis(1),
            read: false,
        };
        let n2 = n1.clone();
        assert!(mark_notification_read(&mut n1));
        assert!(!mark_notification_read(&mut n1));

        let notifications = vec![n1, n2];
        assert_eq!(unread_notifications(&notifications), 1);
    }
}
