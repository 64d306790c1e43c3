//! Veranda core: data model and effect seams for the realtime sync engine.
//!
//! The surrounding application is a social-posting client whose persistence,
//! query execution, and authentication live in an external managed backend.
//! This crate defines everything the synchronization engine shares with that
//! boundary:
//!
//! - typed identifiers and millisecond timestamps,
//! - the domain records the reconcilers hold (chats, messages,
//!   notifications, feed posts),
//! - the normalized [`ChangeEvent`] vocabulary delivered over subscription
//!   channels, with [`Scope`]s and [`SelectQuery`]s describing what a
//!   channel or read covers,
//! - the [`ProviderEffects`] and [`ClockEffects`] traits the engine calls
//!   instead of touching the network or the system clock.
//!
//! The engine itself — channels, reconcilers, optimistic mutations,
//! pagination, read state — lives in `veranda-sync`.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod effects;
pub mod errors;
pub mod event;
pub mod ids;
pub mod model;
pub mod query;
pub mod scope;
pub mod time;

pub use effects::{ClockEffects, EventSubscription, ProviderEffects, ProviderError};
pub use errors::CoreError;
pub use event::{decode_row, encode_row, ChangeEvent, ChangeOp, Row};
pub use ids::{
    like_row_id, repost_row_id, ChatId, MessageId, MutationId, NotificationId, PostId, UserId,
};
pub use model::{
    Chat, ChatParticipant, FeedPost, Message, Notification, NotificationKind, ParticipantRef,
};
pub use query::{OrderBy, PageRange, SelectQuery};
pub use scope::{Predicate, Scope, Table};
pub use time::Timestamp;
