//! Unified error type for the core data vocabulary.
//!
//! Everything that can go wrong while decoding rows, payloads, or
//! identifiers funnels into [`CoreError`]. Transport- and request-level
//! failures live with the effect traits (`ProviderError`); this type only
//! covers local interpretation of data.

use thiserror::Error;

/// Errors produced while interpreting provider data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// What failed to parse, and why.
        message: String,
    },

    /// A row or payload could not be decoded into its typed form.
    #[error("decode failure: {message}")]
    Decode {
        /// Underlying decode failure.
        message: String,
    },
}

impl CoreError {
    /// An identifier failed to parse.
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }

    /// A row or payload failed to decode.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<uuid::Error> for CoreError {
    fn from(err: uuid::Error) -> Self {
        Self::invalid_id(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}

/// Convenience alias for core fallible operations.
pub type Result<T> = std::result::Result<T, CoreError>;
