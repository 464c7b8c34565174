//! HTTP route definitions.

mod collections;
mod health;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(collections::routes())
        .merge(ws::routes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::websocket::ConnectionManager;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Router over a pool that never connects; only paths that fail before
    /// touching the database are exercised.
    fn app() -> Router {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/rebound_test")
            .unwrap();
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "postgres://localhost/rebound_test".into(),
            max_connections: 1,
        };
        create_routes().with_state(AppState {
            pool,
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        })
    }

    async fn send(method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = send(Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_invalid_entity_type() {
        let (status, body) = send(Method::GET, "/collections/Tasks", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid entity type: Tasks");
    }

    #[tokio::test]
    async fn test_malformed_create_body() {
        let (status, body) = send(Method::POST, "/collections/tasks", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid request body");
        assert!(body["details"].is_string());
    }

    #[tokio::test]
    async fn test_create_requires_object_payload() {
        let (status, body) = send(Method::POST, "/collections/tasks", r#"{"payload": 5}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "payload must be a JSON object");
    }

    #[tokio::test]
    async fn test_patch_requires_object() {
        let (status, body) =
            send(Method::PATCH, "/collections/tasks/t1", r#"{"patch": [1]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "patch must be a JSON object");
    }

    #[tokio::test]
    async fn test_empty_positions_batch() {
        let (status, _) =
            send(Method::PUT, "/collections/tasks/positions", r#"{"updates": []}"#).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
