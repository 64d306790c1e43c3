//! Data-provider effect trait.
//!
//! The engine never talks to the managed backend directly; everything goes
//! through [`ProviderEffects`]. Production hands this an SDK-backed
//! implementation, tests hand it the in-memory provider from the testkit.
//!
//! The provider session is authenticated: selects and subscriptions are
//! already scoped to the signed-in user by the backend, so `select(Chats,
//! All)` means "the current user's chats".

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::event::{ChangeEvent, Row};
use crate::query::SelectQuery;
use crate::scope::{Scope, Table};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by provider implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The underlying connection failed or dropped. Recovered internally by
    /// reconnect + resync; never surfaced to callers.
    #[error("transport failure: {message}")]
    Transport {
        /// What broke.
        message: String,
    },

    /// A read or write was rejected or failed. Surfaced to the caller of
    /// the operation that issued it.
    #[error("request failed: {message}")]
    Request {
        /// Provider-reported failure.
        message: String,
    },

    /// The provider returned data the client could not interpret.
    #[error("provider decode failure: {message}")]
    Decode {
        /// What failed to decode.
        message: String,
    },

    /// The provider has been shut down and accepts no further calls.
    #[error("provider closed: {message}")]
    Closed {
        /// Why it is closed.
        message: String,
    },
}

impl ProviderError {
    /// A connection-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// A rejected or failed read/write.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Uninterpretable provider data.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// The provider is gone.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Whether this is a transport-level failure the channels retry
    /// internally.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

/// A live change-event subscription.
///
/// Events arrive at-least-once and ordered per scope. The stream ending
/// (`None`) signals a transport drop: events during the outage are lost and
/// the owner must resubscribe and resync.
#[derive(Debug)]
pub struct EventSubscription {
    scope: Scope,
    events: UnboundedReceiverStream<ChangeEvent>,
}

impl EventSubscription {
    /// Wrap a receiver of provider events.
    pub fn new(scope: Scope, events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self {
            scope,
            events: UnboundedReceiverStream::new(events),
        }
    }

    /// The scope this subscription covers.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The next event, or `None` once the transport has dropped.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        use futures::StreamExt;
        self.events.next().await
    }
}

impl Stream for EventSubscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Effect trait
// ─────────────────────────────────────────────────────────────────────────────

/// Request/response and subscription access to the external data provider.
#[async_trait]
pub trait ProviderEffects: Send + Sync {
    /// Point read: initial load, resync after a gap, pagination, hydration.
    async fn select(&self, query: SelectQuery) -> Result<Vec<Row>, ProviderError>;

    /// Create a row. Returns the stored row (server-assigned columns
    /// included).
    async fn insert(&self, table: Table, row: Row) -> Result<Row, ProviderError>;

    /// Patch columns of an existing row by id. Returns the stored row.
    async fn update(&self, table: Table, id: Uuid, patch: Row) -> Result<Row, ProviderError>;

    /// Delete a row by id.
    async fn delete(&self, table: Table, id: Uuid) -> Result<(), ProviderError>;

    /// Open a change-event subscription for a scope.
    async fn subscribe(&self, scope: Scope) -> Result<EventSubscription, ProviderError>;
}

#[async_trait]
impl<P: ProviderEffects + ?Sized> ProviderEffects for Arc<P> {
    async fn select(&self, query: SelectQuery) -> Result<Vec<Row>, ProviderError> {
        (**self).select(query).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, ProviderError> {
        (**self).insert(table, row).await
    }

    async fn update(&self, table: Table, id: Uuid, patch: Row) -> Result<Row, ProviderError> {
        (**self).update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: Uuid) -> Result<(), ProviderError> {
        (**self).delete(table, id).await
    }

    async fn subscribe(&self, scope: Scope) -> Result<EventSubscription, ProviderError> {
        (**self).subscribe(scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeOp;
    use crate::time::Timestamp;

    #[tokio::test]
    async fn subscription_yields_events_then_signals_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = EventSubscription::new(Scope::feed(), rx);

        let event = ChangeEvent::new(
            Table::Posts,
            ChangeOp::Insert,
            Uuid::new_v4(),
            Row::new(),
            Timestamp::from_millis(1),
        );
        tx.send(event.clone()).unwrap();
        assert_eq!(sub.next_event().await, Some(event));

        drop(tx);
        assert_eq!(sub.next_event().await, None);
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        use futures::StreamExt;

        let (tx, rx) = mpsc::unbounded_channel();
        let sub = EventSubscription::new(Scope::feed(), rx);

        for i in 0..3u64 {
            tx.send(ChangeEvent::new(
                Table::Posts,
                ChangeOp::Insert,
                Uuid::new_v4(),
                Row::new(),
                Timestamp::from_millis(i),
            ))
            .unwrap();
        }
        drop(tx);

        let collected: Vec<ChangeEvent> = sub.collect().await;
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn error_constructors_and_predicates() {
        assert!(ProviderError::transport("socket reset").is_transport());
        assert!(!ProviderError::request("row not found").is_transport());
        assert_eq!(
            ProviderError::closed("shutdown").to_string(),
            "provider closed: shutdown"
        );
    }
}
