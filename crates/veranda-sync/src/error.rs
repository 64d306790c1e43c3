//! Engine error type.
//!
//! Only two entry points surface provider failures to callers: `perform`
//! (after the optimistic undo has run) and `fetch_next_page`. Transport
//! drops never appear here — the channels recover them internally with
//! reconnect + resync. Merge conflicts never appear here either — they are
//! logged no-ops corrected by the next resync.

use thiserror::Error;
use veranda_core::{CoreError, ProviderError};

/// Errors surfaced by the sync engine's public API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A provider read or write failed. For optimistic mutations the local
    /// effect has already been rolled back when this is returned.
    #[error("request failed: {message}")]
    Request {
        /// Provider-reported failure.
        message: String,
    },

    /// Provider data could not be interpreted.
    #[error("decode failure: {message}")]
    Decode {
        /// What failed to decode.
        message: String,
    },

    /// The operation requires a signed-in session.
    #[error("no active session: {message}")]
    NoSession {
        /// Which operation was attempted.
        message: String,
    },

    /// An internal engine failure: an actor mailbox or reply channel is
    /// gone. Indicates shutdown mid-operation, not a recoverable condition.
    #[error("engine failure: {message}")]
    Engine {
        /// What was unreachable.
        message: String,
    },
}

impl SyncError {
    /// A failed provider read or write.
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

    /// An operation that needs a session was called while signed out.
    pub fn no_session(message: impl Into<String>) -> Self {
        Self::NoSession {
            message: message.into(),
        }
    }

    /// An actor or reply channel was unreachable.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            // A transport failure reaching a caller means the request it
            // issued did not complete; from the caller's view that is a
            // failed request. Channel-internal transport failures are
            // retried long before this conversion runs.
            ProviderError::Transport { message } | ProviderError::Request { message } => {
                Self::Request { message }
            }
            ProviderError::Decode { message } => Self::Decode { message },
            ProviderError::Closed { message } => Self::Engine { message },
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidId { message } | CoreError::Decode { message } => {
                Self::Decode { message }
            }
        }
    }
}

/// Convenience alias for engine-facing fallible operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn provider_failures_map_to_caller_taxonomy() {
        assert_eq!(
            SyncError::from(ProviderError::request("rejected")),
            SyncError::request("rejected")
        );
        assert_eq!(
            SyncError::from(ProviderError::transport("socket reset")),
            SyncError::request("socket reset")
        );
        assert_eq!(
            SyncError::from(ProviderError::decode("bad row")),
            SyncError::decode("bad row")
        );
        assert_matches!(
            SyncError::from(ProviderError::closed("gone")),
            SyncError::Engine { .. }
        );
    }

    #[test]
    fn display_names_the_failure() {
        assert_eq!(
            SyncError::no_session("perform").to_string(),
            "no active session: perform"
        );
    }
}
