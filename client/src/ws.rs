//! WebSocket change feed.
//!
//! One connection carries every subscription. A writer task drains outgoing
//! messages and keeps the connection alive with pings; a reader task routes
//! `change` messages to the subscription they belong to and answers pending
//! `subscribe` requests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rebound_engine::ChangeEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use crate::error::FeedError;
use crate::feed::{ChangeFeed, FeedFilter, Subscription, SubscriptionId};

/// How long `subscribe` waits for the server's acknowledgement.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        entity_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<FeedFilter>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        subscription_id: SubscriptionId,
        entity_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Change {
        subscription_id: SubscriptionId,
        event: ChangeEvent<Value>,
    },
    Pong,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

type EventSender = mpsc::UnboundedSender<ChangeEvent<Value>>;

struct PendingSubscribe {
    reply: oneshot::Sender<Result<SubscriptionId, FeedError>>,
    events: EventSender,
}

struct Shared {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: DashMap<String, PendingSubscribe>,
    routes: DashMap<SubscriptionId, EventSender>,
    closed: AtomicBool,
    next_request: AtomicU64,
}

impl Shared {
    fn route(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable feed message");
                return;
            }
        };

        match message {
            ServerMessage::Subscribed {
                subscription_id,
                entity_type,
                request_id,
            } => {
                let Some((_, pending)) = request_id.and_then(|id| self.pending.remove(&id)) else {
                    debug!(subscription = %subscription_id, "unsolicited subscription ack");
                    return;
                };
                debug!(subscription = %subscription_id, entity_type = %entity_type, "subscribed");
                self.routes.insert(subscription_id.clone(), pending.events);
                let _ = pending.reply.send(Ok(subscription_id));
            }
            ServerMessage::Change {
                subscription_id,
                event,
            } => {
                let delivered = self
                    .routes
                    .get(&subscription_id)
                    .map(|route| route.send(event).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        self.routes.remove(&subscription_id);
                    }
                    None => trace!(subscription = %subscription_id, "change for unknown subscription"),
                }
            }
            ServerMessage::Pong => trace!("pong"),
            ServerMessage::Error {
                message,
                request_id,
            } => match request_id.and_then(|id| self.pending.remove(&id)) {
                Some((_, pending)) => {
                    let _ = pending.reply.send(Err(FeedError::Rejected(message)));
                }
                None => warn!(error = %message, "feed error"),
            },
        }
    }

    /// Mark the connection dead: end every subscription and fail every
    /// outstanding request.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.routes.clear();

        let waiting: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for request_id in waiting {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.reply.send(Err(FeedError::Closed));
            }
        }
    }
}

/// [`ChangeFeed`] over the server's WebSocket endpoint.
pub struct WebSocketFeed {
    shared: Arc<Shared>,
    subscribe_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketFeed {
    /// Open the connection and start the reader and writer tasks.
    pub async fn connect(url: &str) -> Result<Self, FeedError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        debug!(url = %url, "feed connected");

        let (mut sink, mut read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let shared = Arc::new(Shared {
            outbound,
            pending: DashMap::new(),
            routes: DashMap::new(),
            closed: AtomicBool::new(false),
            next_request: AtomicU64::new(1),
        });

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await;

            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = ping.tick() => ClientMessage::Ping,
                };

                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize feed message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "feed write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_shared.route(&text),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "feed closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "feed read failed");
                        break;
                    }
                }
            }
            reader_shared.shutdown();
        });

        Ok(Self {
            shared,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            reader,
            writer,
        })
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Every subscription ends.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.shutdown();
    }
}

impl Drop for WebSocketFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl ChangeFeed for WebSocketFeed {
    async fn subscribe(
        &self,
        entity_type: &str,
        filter: Option<FeedFilter>,
    ) -> Result<Subscription, FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }

        let request_id = format!(
            "sub-{}",
            self.shared.next_request.fetch_add(1, Ordering::SeqCst)
        );
        let (reply, reply_rx) = oneshot::channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        self.shared
            .pending
            .insert(request_id.clone(), PendingSubscribe { reply, events });

        let sent = self.shared.outbound.send(ClientMessage::Subscribe {
            entity_type: entity_type.to_string(),
            filter,
            request_id: Some(request_id.clone()),
        });
        if sent.is_err() {
            self.shared.pending.remove(&request_id);
            return Err(FeedError::Closed);
        }

        match tokio::time::timeout(self.subscribe_timeout, reply_rx).await {
            Ok(Ok(Ok(id))) => Ok(Subscription {
                id,
                entity_type: entity_type.to_string(),
                events: events_rx,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(FeedError::Closed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(FeedError::Timeout)
            }
        }
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError> {
        self.shared.routes.remove(id);
        if !self.is_closed() {
            let _ = self.shared.outbound.send(ClientMessage::Unsubscribe {
                subscription_id: id.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn send(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        message: ServerMessage,
    ) {
        let text = serde_json::to_string(&message).unwrap();
        ws.send(Message::Text(text)).await.unwrap();
    }

    /// Accepts one connection. Acks subscriptions as `s1` followed by one
    /// delete event, and refuses the `forbidden` entity type.
    async fn fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            while let Some(Ok(Message::Text(text))) = ws.next().await {
                match serde_json::from_str::<ClientMessage>(&text).unwrap() {
                    ClientMessage::Subscribe {
                        entity_type,
                        request_id,
                        ..
                    } if entity_type == "forbidden" => {
                        send(
                            &mut ws,
                            ServerMessage::Error {
                                message: "not allowed".into(),
                                request_id,
                            },
                        )
                        .await;
                    }
                    ClientMessage::Subscribe {
                        entity_type,
                        request_id,
                        ..
                    } => {
                        let subscription_id = SubscriptionId("s1".into());
                        send(
                            &mut ws,
                            ServerMessage::Subscribed {
                                subscription_id: subscription_id.clone(),
                                entity_type,
                                request_id,
                            },
                        )
                        .await;
                        send(
                            &mut ws,
                            ServerMessage::Change {
                                subscription_id,
                                event: ChangeEvent::Delete { id: "t1".into() },
                            },
                        )
                        .await;
                    }
                    ClientMessage::Unsubscribe { .. } => {}
                    ClientMessage::Ping => send(&mut ws, ServerMessage::Pong).await,
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::Subscribe {
            entity_type: "tasks".into(),
            filter: Some(FeedFilter::eq("user_id", "u1")),
            request_id: Some("sub-1".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "subscribe",
                "entity_type": "tasks",
                "filter": {"field": "user_id", "value": "u1"},
                "request_id": "sub-1"
            })
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn test_server_message_parsing() {
        let json = r#"{"type":"change","subscription_id":"s1","event":{"type":"update","entity":{"id":"t1","position":2,"payload":{"title":"A"},"updatedAt":5}}}"#;
        match serde_json::from_str::<ServerMessage>(json).unwrap() {
            ServerMessage::Change {
                subscription_id,
                event: ChangeEvent::Update { entity },
            } => {
                assert_eq!(subscription_id.0, "s1");
                assert_eq!(entity.position, Some(2));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let url = fake_server().await;
        let feed = WebSocketFeed::connect(&url).await.unwrap();

        let mut subscription = feed.subscribe("tasks", None).await.unwrap();
        assert_eq!(subscription.id.0, "s1");
        assert_eq!(
            subscription.events.recv().await,
            Some(ChangeEvent::Delete { id: "t1".into() })
        );

        feed.unsubscribe(&subscription.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let url = fake_server().await;
        let feed = WebSocketFeed::connect(&url).await.unwrap();

        let err = feed.subscribe("forbidden", None).await.unwrap_err();
        assert_eq!(err, FeedError::Rejected("not allowed".into()));
    }

    #[tokio::test]
    async fn test_closed_feed_refuses_subscriptions() {
        let url = fake_server().await;
        let feed = WebSocketFeed::connect(&url).await.unwrap();
        feed.close();

        assert!(feed.is_closed());
        assert_eq!(feed.subscribe("tasks", None).await.unwrap_err(), FeedError::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let err = WebSocketFeed::connect("ws://127.0.0.1:1/ws").await.err().unwrap();
        assert!(matches!(err, FeedError::Connection(_)));
    }
}
