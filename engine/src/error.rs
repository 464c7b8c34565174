//! Error types for the rebound engine.

use crate::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Precondition failures of optimistic helpers.
///
/// Applying a change or rolling back never fails; only starting a mutation
/// against state that does not allow it does, or decoding a malformed view
/// snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity already exists: {0}")]
    DuplicateEntity(EntityId),

    #[error("invalid reorder: {0}")]
    InvalidReorder(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by the remote store.
///
/// The message is whatever the server supplied. Transport failures, timeouts
/// and validation errors all look the same from here.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::EntityNotFound("t1".into());
        assert_eq!(err.to_string(), "entity not found: t1");

        let err = Error::InvalidReorder("duplicate id: a".into());
        assert_eq!(err.to_string(), "invalid reorder: duplicate id: a");

        let err = RemoteError::new("conflict");
        assert_eq!(err.to_string(), "conflict");
    }

    #[test]
    fn remote_error_wire_format() {
        let err: RemoteError = serde_json::from_str(r#"{"message":"conflict"}"#).unwrap();
        assert_eq!(err.message, "conflict");
    }
}
