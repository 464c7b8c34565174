//! Error types for the rebound client.

use thiserror::Error;

pub use rebound_engine::RemoteError;

/// Failures surfaced by collection operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// The operation was invalid against the current local state.
    #[error(transparent)]
    Engine(#[from] rebound_engine::Error),

    /// The remote store rejected the operation; it has been rolled back.
    #[error("remote failure: {0}")]
    Remote(#[from] RemoteError),

    /// The change feed could not be attached.
    #[error("change feed error: {0}")]
    Feed(#[from] FeedError),
}

impl SyncError {
    /// The server-supplied failure, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors of a change-feed connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    /// Connecting to the feed failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection is gone.
    #[error("feed connection closed")]
    Closed,

    /// The server refused a request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// No reply arrived in time.
    #[error("timed out waiting for the server")]
    Timeout,

    /// Unknown subscription.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
}

/// Client configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("REBOUND_API_URL environment variable is required")]
    MissingApiUrl,

    #[error("Invalid REBOUND_REQUEST_TIMEOUT_MS value")]
    InvalidTimeout,

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
