//! Typed identifiers for every entity the engine tracks.
//!
//! All identifiers are UUID newtypes with transparent serde so they decode
//! straight out of provider rows. Fresh ids use v4; interaction rows (likes,
//! reposts) use deterministic v5 ids derived from the (post, user) pair so a
//! later un-like can address the row without a filtered delete.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s).map_err(|err| {
                    CoreError::invalid_id(format!("{}: {err}", stringify!($name)))
                })?))
            }
        }
    };
}

id_type!(
    /// A signed-in user (supplied by the external identity provider).
    UserId
);
id_type!(
    /// A direct-message chat.
    ChatId
);
id_type!(
    /// A message within a chat. Unique across all chats.
    MessageId
);
id_type!(
    /// A notification row.
    NotificationId
);
id_type!(
    /// A feed post.
    PostId
);
id_type!(
    /// A pending optimistic mutation.
    MutationId
);

/// Namespace for deterministic like-row ids.
const LIKE_NAMESPACE: Uuid = Uuid::from_u128(0x6c696b65_7665_7261_6e64_615f6e730001);

/// Namespace for deterministic repost-row ids.
const REPOST_NAMESPACE: Uuid = Uuid::from_u128(0x7265706f_7374_7665_7261_6e64615f0002);

fn interaction_id(namespace: &Uuid, post: PostId, user: UserId) -> Uuid {
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(post.as_uuid().as_bytes());
    name[16..].copy_from_slice(user.as_uuid().as_bytes());
    Uuid::new_v5(namespace, &name)
}

/// Deterministic row id for the like created by `user` on `post`.
///
/// The same (post, user) pair always maps to the same id, so the client can
/// delete its own like without knowing the server-assigned row.
pub fn like_row_id(post: PostId, user: UserId) -> Uuid {
    interaction_id(&LIKE_NAMESPACE, post, user)
}

/// Deterministic row id for the repost created by `user` on `post`.
pub fn repost_row_id(post: PostId, user: UserId) -> Uuid {
    interaction_id(&REPOST_NAMESPACE, post, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = ChatId::new();
        let parsed: ChatId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<MessageId>().unwrap_err();
        assert_matches!(err, CoreError::InvalidId { .. });
    }

    #[test]
    fn serde_is_transparent() {
        let id = PostId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PostId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn interaction_ids_are_deterministic() {
        let post = PostId::new();
        let user = UserId::new();
        assert_eq!(like_row_id(post, user), like_row_id(post, user));
        assert_ne!(like_row_id(post, user), repost_row_id(post, user));

        let other = UserId::new();
        assert_ne!(like_row_id(post, user), like_row_id(post, other));
    }
}
