//! WebSocket handler for the change feed.
//!
//! Each connection can hold any number of subscriptions. Changes reach it
//! through the connection manager; this loop only answers control messages.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};

use super::validate_entity_type;

/// Handle an established WebSocket connection.
///
/// Registers the connection, forwards queued messages to the socket from a
/// separate task, and answers control messages until the client goes away.
/// All of the connection's subscriptions are dropped on disconnect.
pub async fn handle_websocket_connection(socket: WebSocket, conn_manager: Arc<ConnectionManager>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(tx);

    tracing::info!(conn_id = %conn_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) = process_message(&text, &conn_manager, &conn_id) {
                    conn_manager.send_to(&conn_id, response);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply, if any.
///
/// Unsubscribe is fire-and-forget and never answered.
pub fn process_message(
    text: &str,
    conn_manager: &ConnectionManager,
    conn_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                format!("Invalid message format: {}", e),
                None,
            ));
        }
    };

    match client_msg {
        ClientMessage::Subscribe {
            entity_type,
            filter,
            request_id,
        } => {
            if let Err(e) = validate_entity_type(&entity_type) {
                return Some(ServerMessage::error(e.to_string(), request_id));
            }

            let subscription_id = conn_manager.subscribe(conn_id, entity_type.clone(), filter);
            Some(ServerMessage::Subscribed {
                subscription_id,
                entity_type,
                request_id,
            })
        }

        ClientMessage::Unsubscribe { subscription_id } => {
            if !conn_manager.unsubscribe(conn_id, &subscription_id) {
                tracing::debug!(
                    conn_id = %conn_id,
                    subscription_id = %subscription_id,
                    "Unsubscribe for unknown subscription"
                );
            }
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebound_engine::{ChangeEvent, Entity};
    use serde_json::json;

    fn connected() -> (
        ConnectionManager,
        String,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let manager = ConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = manager.register(tx);
        (manager, conn_id, rx)
    }

    #[test]
    fn test_subscribe_then_receive_change() {
        let (manager, conn_id, mut rx) = connected();

        let reply = process_message(
            r#"{"type":"subscribe","entity_type":"tasks","request_id":"r1"}"#,
            &manager,
            &conn_id,
        );
        let subscription_id = match reply {
            Some(ServerMessage::Subscribed {
                subscription_id,
                entity_type,
                request_id,
            }) => {
                assert_eq!(entity_type, "tasks");
                assert_eq!(request_id.as_deref(), Some("r1"));
                subscription_id
            }
            other => panic!("Expected Subscribed, got {:?}", other),
        };

        let payload = json!({"title": "A"});
        manager.publish(
            "tasks",
            &payload,
            ChangeEvent::Insert {
                entity: Entity::new("t1", payload.clone(), 1000),
            },
        );

        match rx.try_recv().unwrap() {
            ServerMessage::Change {
                subscription_id: got,
                event,
            } => {
                assert_eq!(got, subscription_id);
                assert_eq!(event.entity_id(), "t1");
            }
            other => panic!("Expected Change, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_invalid_entity_type() {
        let (manager, conn_id, _rx) = connected();

        let reply = process_message(
            r#"{"type":"subscribe","entity_type":"Tasks!","request_id":"r2"}"#,
            &manager,
            &conn_id,
        );

        match reply {
            Some(ServerMessage::Error { request_id, .. }) => {
                assert_eq!(request_id.as_deref(), Some("r2"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_has_no_reply() {
        let (manager, conn_id, _rx) = connected();
        manager.subscribe(&conn_id, "tasks".into(), None);

        let reply = process_message(
            r#"{"type":"unsubscribe","subscription_id":"missing"}"#,
            &manager,
            &conn_id,
        );
        assert!(reply.is_none());
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn test_ping_and_garbage() {
        let (manager, conn_id, _rx) = connected();

        assert!(matches!(
            process_message(r#"{"type":"ping"}"#, &manager, &conn_id),
            Some(ServerMessage::Pong)
        ));
        assert!(matches!(
            process_message("not json", &manager, &conn_id),
            Some(ServerMessage::Error {
                request_id: None,
                ..
            })
        ));
    }
}
