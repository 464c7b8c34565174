//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names. Change
//! events embed entities in their REST form (camelCase).

use rebound_engine::ChangeEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload field equality filter for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFilter {
    pub field: String,
    pub value: Value,
}

impl FeedFilter {
    /// Whether a payload passes the filter.
    pub fn matches(&self, payload: &Value) -> bool {
        payload.get(&self.field) == Some(&self.value)
    }
}

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving changes for an entity type.
    Subscribe {
        /// Entity type to watch
        entity_type: String,
        /// Optional payload filter
        #[serde(default)]
        filter: Option<FeedFilter>,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Stop a subscription.
    Unsubscribe {
        subscription_id: String,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a subscribe request.
    Subscribed {
        subscription_id: String,
        entity_type: String,
        /// Request ID from the original request
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A committed write matching a subscription.
    Change {
        subscription_id: String,
        event: ChangeEvent<Value>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}
