//! Change feed contract.
//!
//! A feed pushes insert/update/delete notifications for changes made
//! anywhere, including by this client. Events carry raw JSON payloads so one
//! connection can serve every entity type; collections decode them.

use std::fmt;

use async_trait::async_trait;
use rebound_engine::ChangeEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FeedError;

/// Handle of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload field equality filter, e.g. `user_id = <id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFilter {
    pub field: String,
    pub value: Value,
}

impl FeedFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether a payload passes the filter.
    pub fn matches(&self, payload: &Value) -> bool {
        payload.get(&self.field) == Some(&self.value)
    }
}

/// An active subscription. Events stop when the feed drops the sender,
/// i.e. after `unsubscribe` or when the connection closes.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub entity_type: String,
    pub events: mpsc::UnboundedReceiver<ChangeEvent<Value>>,
}

/// Push channel of remote changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start receiving events for `entity_type`, optionally filtered.
    async fn subscribe(
        &self,
        entity_type: &str,
        filter: Option<FeedFilter>,
    ) -> Result<Subscription, FeedError>;

    /// Stop a subscription. Unknown ids are not an error.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError>;
}
