//! Collection endpoint routes.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, patch, put},
    Json, Router,
};
use rebound_engine::Entity;
use serde_json::Value;

use crate::error::Result;
use crate::handlers::{
    handle_create, handle_delete, handle_list, handle_set_positions, handle_update,
    CreateRequest, PatchRequest, PositionsRequest,
};
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/collections/{entity_type}",
            get(list_handler).post(create_handler),
        )
        .route(
            "/collections/{entity_type}/positions",
            put(positions_handler),
        )
        .route(
            "/collections/{entity_type}/{id}",
            patch(update_handler).delete(delete_handler),
        )
}

/// GET /collections/{type} - List entities in server order.
async fn list_handler(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> Result<Json<Vec<Entity<Value>>>> {
    let entities = handle_list(&state.pool, &entity_type).await?;
    Ok(Json(entities))
}

/// POST /collections/{type} - Create an entity.
async fn create_handler(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    body: std::result::Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Entity<Value>>)> {
    let Json(request) = body?;
    let entity = handle_create(&state.pool, &state.conn_manager, &entity_type, request).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

/// PATCH /collections/{type}/{id} - Shallow-merge a patch.
async fn update_handler(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    body: std::result::Result<Json<PatchRequest>, JsonRejection>,
) -> Result<Json<Entity<Value>>> {
    let Json(request) = body?;
    let entity =
        handle_update(&state.pool, &state.conn_manager, &entity_type, &id, request).await?;
    Ok(Json(entity))
}

/// DELETE /collections/{type}/{id} - Delete an entity.
async fn delete_handler(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    handle_delete(&state.pool, &state.conn_manager, &entity_type, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /collections/{type}/positions - Write positions atomically.
async fn positions_handler(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    body: std::result::Result<Json<PositionsRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(request) = body?;
    handle_set_positions(&state.pool, &state.conn_manager, &entity_type, request).await?;
    Ok(StatusCode::NO_CONTENT)
}
