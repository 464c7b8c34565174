//! Rebound Server - reference backend for optimistic clients.
//!
//! Serves entity collections over REST and pushes every committed write to
//! subscribed clients over a WebSocket change feed.

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::db::Pool;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rebound_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        "Starting Rebound Server"
    );

    let pool = db::create_pool(&config.database_url, config.max_connections).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let state = AppState {
        pool,
        config: Arc::new(config),
        conn_manager: ConnectionManager::new_shared(),
    };
    let addr = format!("{}:{}", state.config.host, state.config.port);

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
