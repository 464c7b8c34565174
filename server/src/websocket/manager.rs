//! WebSocket connection manager.
//!
//! Tracks active connections and their subscriptions, and fans committed
//! writes out to every subscription that matches them.

use std::sync::Arc;

use dashmap::DashMap;
use rebound_engine::ChangeEvent;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{FeedFilter, ServerMessage};

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// One subscription of one connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub conn_id: String,
    pub entity_type: String,
    pub filter: Option<FeedFilter>,
}

impl Subscription {
    fn matches(&self, entity_type: &str, payload: &Value) -> bool {
        self.entity_type == entity_type
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(payload))
    }
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// All subscriptions, keyed by subscription ID.
    subscriptions: DashMap<String, Subscription>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(conn_id.clone(), Connection { sender });

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection and drop its subscriptions.
    pub fn unregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            self.subscriptions.retain(|_, sub| sub.conn_id != conn_id);
            tracing::info!(conn_id = %conn_id, "WebSocket connection unregistered");
        }
    }

    /// Add a subscription for a connection.
    ///
    /// Returns the subscription ID.
    pub fn subscribe(
        &self,
        conn_id: &str,
        entity_type: String,
        filter: Option<FeedFilter>,
    ) -> String {
        let subscription_id = uuid::Uuid::new_v4().to_string();

        tracing::debug!(
            conn_id = %conn_id,
            subscription_id = %subscription_id,
            entity_type = %entity_type,
            filtered = filter.is_some(),
            "Subscription added"
        );

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                conn_id: conn_id.to_string(),
                entity_type,
                filter,
            },
        );

        subscription_id
    }

    /// Remove a subscription owned by `conn_id`.
    ///
    /// Returns false if it does not exist or belongs to another connection.
    pub fn unsubscribe(&self, conn_id: &str, subscription_id: &str) -> bool {
        self.subscriptions
            .remove_if(subscription_id, |_, sub| sub.conn_id == conn_id)
            .is_some()
    }

    /// Send a change to every subscription that matches it.
    ///
    /// `payload` is the row the filters are evaluated against; for deletes it
    /// is the payload of the removed row. Returns the number of deliveries.
    pub fn publish(&self, entity_type: &str, payload: &Value, event: ChangeEvent<Value>) -> usize {
        let targets: Vec<(String, String)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().matches(entity_type, payload))
            .map(|entry| (entry.key().clone(), entry.value().conn_id.clone()))
            .collect();

        let mut sent_count = 0;
        for (subscription_id, conn_id) in targets {
            let message = ServerMessage::Change {
                subscription_id,
                event: event.clone(),
            };
            if self.send_to(&conn_id, message) {
                sent_count += 1;
            }
        }

        tracing::debug!(
            entity_type = %entity_type,
            id = %event.entity_id(),
            kind = event.kind(),
            recipients = sent_count,
            "Published change"
        );

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebound_engine::Entity;
    use serde_json::json;

    fn insert(id: &str, payload: Value) -> ChangeEvent<Value> {
        ChangeEvent::Insert {
            entity: Entity::new(id, payload, 1000),
        }
    }

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register(tx);
        manager.subscribe(&conn_id, "tasks".into(), None);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.subscription_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_publish_reaches_writer_and_others() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let conn1 = manager.register(tx1);
        let conn2 = manager.register(tx2);
        let sub1 = manager.subscribe(&conn1, "tasks".into(), None);
        manager.subscribe(&conn2, "tasks".into(), None);

        let payload = json!({"title": "A"});
        let sent = manager.publish("tasks", &payload, insert("t1", payload.clone()));
        assert_eq!(sent, 2);

        match rx1.try_recv().unwrap() {
            ServerMessage::Change {
                subscription_id, ..
            } => assert_eq!(subscription_id, sub1),
            other => panic!("Expected Change, got {:?}", other),
        }
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_publish_respects_type_and_filter() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = manager.register(tx);
        manager.subscribe(
            &conn_id,
            "tasks".into(),
            Some(FeedFilter {
                field: "user_id".into(),
                value: json!("u1"),
            }),
        );

        let theirs = json!({"user_id": "u2"});
        assert_eq!(manager.publish("tasks", &theirs, insert("t1", theirs.clone())), 0);

        let goal = json!({"user_id": "u1"});
        assert_eq!(manager.publish("goals", &goal, insert("g1", goal.clone())), 0);

        let mine = json!({"user_id": "u1"});
        assert_eq!(manager.publish("tasks", &mine, insert("t2", mine.clone())), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_only_own() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let conn1 = manager.register(tx1);
        let conn2 = manager.register(tx2);
        let sub = manager.subscribe(&conn1, "tasks".into(), None);

        assert!(!manager.unsubscribe(&conn2, &sub));
        assert!(manager.unsubscribe(&conn1, &sub));
        assert!(!manager.unsubscribe(&conn1, &sub));
    }
}
