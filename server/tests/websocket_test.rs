//! Wire compatibility between the client feed and the server protocol.
//!
//! The server binary's types are not importable from here, so its side of
//! the protocol is mirrored below and checked against the client's types.

use rebound_client::ws::{ClientMessage, ServerMessage};
use rebound_client::{FeedFilter, SubscriptionId};
use rebound_engine::{ChangeEvent, Entity};
use serde_json::{json, Value};

/// Server-side view of incoming messages.
#[derive(serde::Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerInbound {
    Subscribe {
        entity_type: String,
        #[serde(default)]
        filter: Option<ServerFilter>,
        #[serde(default)]
        request_id: Option<String>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Ping,
}

#[derive(serde::Deserialize, Debug)]
struct ServerFilter {
    field: String,
    value: Value,
}

/// Server-side view of outgoing messages.
#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code)]
enum ServerOutbound {
    Subscribed {
        subscription_id: String,
        entity_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Change {
        subscription_id: String,
        event: ChangeEvent<Value>,
    },
    Pong,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

fn to_client(msg: &ServerOutbound) -> ServerMessage {
    let text = serde_json::to_string(msg).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn to_server(msg: &ClientMessage) -> ServerInbound {
    let text = serde_json::to_string(msg).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[cfg(test)]
mod websocket_protocol_tests {
    use super::*;

    #[test]
    fn test_filtered_subscribe_reaches_server() {
        let msg = ClientMessage::Subscribe {
            entity_type: "tasks".to_string(),
            filter: Some(FeedFilter::eq("user_id", "u1")),
            request_id: Some("req-001".to_string()),
        };

        match to_server(&msg) {
            ServerInbound::Subscribe {
                entity_type,
                filter,
                request_id,
            } => {
                assert_eq!(entity_type, "tasks");
                let filter = filter.expect("filter");
                assert_eq!(filter.field, "user_id");
                assert_eq!(filter.value, json!("u1"));
                assert_eq!(request_id, Some("req-001".to_string()));
            }
            other => panic!("Expected Subscribe message, got {:?}", other),
        }
    }

    #[test]
    fn test_unfiltered_subscribe_omits_optional_fields() {
        let msg = ClientMessage::Subscribe {
            entity_type: "goals".to_string(),
            filter: None,
            request_id: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","entity_type":"goals"}"#);
        assert!(matches!(
            to_server(&msg),
            ServerInbound::Subscribe {
                filter: None,
                request_id: None,
                ..
            }
        ));
    }

    #[test]
    fn test_unsubscribe_and_ping_reach_server() {
        let msg = ClientMessage::Unsubscribe {
            subscription_id: SubscriptionId("sub-1".to_string()),
        };
        match to_server(&msg) {
            ServerInbound::Unsubscribe { subscription_id } => assert_eq!(subscription_id, "sub-1"),
            other => panic!("Expected Unsubscribe message, got {:?}", other),
        }

        assert!(matches!(to_server(&ClientMessage::Ping), ServerInbound::Ping));
    }

    #[test]
    fn test_subscribed_reaches_client() {
        let msg = ServerOutbound::Subscribed {
            subscription_id: "sub-1".to_string(),
            entity_type: "tasks".to_string(),
            request_id: Some("req-001".to_string()),
        };

        assert_eq!(
            to_client(&msg),
            ServerMessage::Subscribed {
                subscription_id: SubscriptionId("sub-1".to_string()),
                entity_type: "tasks".to_string(),
                request_id: Some("req-001".to_string()),
            }
        );
    }

    #[test]
    fn test_change_events_reach_client() {
        let entity = Entity::new("t1", json!({"title": "A", "user_id": "u1"}), 1706745600000)
            .with_position(2);

        for event in [
            ChangeEvent::Insert {
                entity: entity.clone(),
            },
            ChangeEvent::Update {
                entity: entity.clone(),
            },
            ChangeEvent::Delete {
                id: "t1".to_string(),
            },
        ] {
            let msg = ServerOutbound::Change {
                subscription_id: "sub-1".to_string(),
                event: event.clone(),
            };

            match to_client(&msg) {
                ServerMessage::Change {
                    subscription_id,
                    event: received,
                } => {
                    assert_eq!(subscription_id.0, "sub-1");
                    assert_eq!(received, event);
                }
                other => panic!("Expected Change message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_change_entity_uses_rest_field_names() {
        let msg = ServerOutbound::Change {
            subscription_id: "sub-1".to_string(),
            event: ChangeEvent::Update {
                entity: Entity::new("t1", json!({"title": "A"}), 1000),
            },
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"change""#));
        assert!(json.contains(r#""type":"update""#));
        assert!(json.contains(r#""updatedAt":1000"#));
        assert!(json.contains(r#""position":null"#));
    }

    #[test]
    fn test_pong_and_error_reach_client() {
        assert_eq!(to_client(&ServerOutbound::Pong), ServerMessage::Pong);

        let msg = ServerOutbound::Error {
            message: "Invalid request: invalid entity type: Tasks".to_string(),
            request_id: Some("req-003".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));

        assert_eq!(
            to_client(&msg),
            ServerMessage::Error {
                message: "Invalid request: invalid entity type: Tasks".to_string(),
                request_id: Some("req-003".to_string()),
            }
        );
    }
}
