//! Subscription scopes: what slice of the backend a channel covers.
//!
//! A [`Scope`] is a (table, predicate) pair. It keys the subscription
//! manager's channel map, so it must hash and compare cheaply; predicate
//! values are kept as strings for that reason (every filtered column in the
//! engine is an id).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Row;
use crate::ids::{ChatId, UserId};

/// Tables the engine reads, writes, or subscribes to.
///
/// `Likes` and `Reposts` are write-only interaction tables; the engine
/// never subscribes to them and learns their effects from echoed post
/// events instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Direct-message chats.
    Chats,
    /// Messages within chats.
    Messages,
    /// Chat-participant rows (read watermarks live here).
    Participants,
    /// Notifications.
    Notifications,
    /// Feed posts.
    Posts,
    /// Like interaction rows.
    Likes,
    /// Repost interaction rows.
    Reposts,
}

impl Table {
    /// Stable string form used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chats => "chats",
            Self::Messages => "messages",
            Self::Participants => "participants",
            Self::Notifications => "notifications",
            Self::Posts => "posts",
            Self::Likes => "likes",
            Self::Reposts => "reposts",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row filter attached to a scope or select.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// Every row in the table (subject to the provider's own session
    /// scoping).
    All,
    /// Rows whose `column` equals `value` (string comparison; ids and
    /// enum columns only).
    Eq {
        /// Column name.
        column: String,
        /// Expected value.
        value: String,
    },
}

impl Predicate {
    /// An equality filter.
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Whether a raw row satisfies this predicate.
    pub fn matches_row(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::Eq { column, value } => row
                .get(column)
                .map(|v| match v {
                    Value::String(s) => s == value,
                    other => other.to_string() == *value,
                })
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Eq { column, value } => write!(f, "{column} = {value}"),
        }
    }
}

/// A (table, predicate) pair identifying what a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Table covered.
    pub table: Table,
    /// Row filter.
    pub predicate: Predicate,
}

impl Scope {
    /// A scope over every row of a table.
    pub fn all(table: Table) -> Self {
        Self {
            table,
            predicate: Predicate::All,
        }
    }

    /// A scope filtered to one column value.
    pub fn filtered(table: Table, column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            table,
            predicate: Predicate::eq(column, value),
        }
    }

    /// The signed-in user's chat-participant rows.
    pub fn participants_of(user: UserId) -> Self {
        Self::filtered(Table::Participants, "user_id", user)
    }

    /// The messages of one chat.
    pub fn messages_of(chat: ChatId) -> Self {
        Self::filtered(Table::Messages, "chat_id", chat)
    }

    /// The signed-in user's notifications.
    pub fn notifications_of(user: UserId) -> Self {
        Self::filtered(Table::Notifications, "recipient_id", user)
    }

    /// The global feed scope.
    pub fn feed() -> Self {
        Self::all(Table::Posts)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.table, self.predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_key_maps_by_value() {
        let user = UserId::new();
        let a = Scope::participants_of(user);
        let b = Scope::participants_of(user);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn predicate_matches_string_columns() {
        let chat = ChatId::new();
        let mut row = Row::new();
        row.insert("chat_id".to_string(), Value::String(chat.to_string()));

        assert!(Predicate::eq("chat_id", chat).matches_row(&row));
        assert!(!Predicate::eq("chat_id", ChatId::new()).matches_row(&row));
        assert!(!Predicate::eq("missing", chat).matches_row(&row));
        assert!(Predicate::All.matches_row(&row));
    }

    #[test]
    fn display_is_compact() {
        let chat = ChatId::new();
        let scope = Scope::messages_of(chat);
        assert_eq!(scope.to_string(), format!("messages[chat_id = {chat}]"));
        assert_eq!(Scope::feed().to_string(), "posts[*]");
    }
}
