//! Veranda sync: the realtime synchronization and reconciliation engine.
//!
//! The engine keeps a signed-in user's local view — chat list, message
//! threads, notifications, ranked feed — continuously consistent with the
//! managed backend it talks to through [`veranda_core::ProviderEffects`]:
//!
//! - [`SyncClient`] is the public facade: session lifecycle, snapshots,
//!   optimistic mutations, read marking, feed paging.
//! - Self-healing subscription channels reconnect with capped backoff and
//!   force a full re-read after every gap, so missed events can never
//!   leave state stale.
//! - Reconcilers merge live change events field-by-field over typed
//!   records, preserving locally derived state the backend does not know.
//! - Optimistic mutations apply locally first and settle exactly once,
//!   through the request result or the echoed change event, whichever
//!   arrives first; failures undo the local effect.
//! - Feed pagination deduplicates across pages, live inserts, and bulk
//!   replaces, so a post can never appear twice.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod optimistic;
pub mod pagination;
pub mod ranking;
pub mod read_state;
pub mod reconcile;

mod channel;
mod subscriptions;

pub use client::SyncClient;
pub use clock::SystemClock;
pub use config::{ChannelConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use optimistic::{Mutation, MutationKind, MutationStatus, MutationTarget};
pub use pagination::PaginationCursor;
pub use reconcile::chats::ChatsSnapshot;
pub use reconcile::feed::FeedSnapshot;
pub use reconcile::notifications::NotificationsSnapshot;
