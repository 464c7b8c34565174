//! Collection handlers - persist writes and publish them to the change feed.
//!
//! Every successful write is published after it has been committed, to all
//! matching subscriptions including the writer's own.

use rebound_engine::{ChangeEvent, Entity, PositionUpdate};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::db::{self, PositionsOutcome};
use crate::error::{AppError, Result};
use crate::websocket::ConnectionManager;

/// Request body for creating an entity.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub payload: Value,
}

/// Request body for a partial update.
#[derive(Debug, Deserialize)]
pub struct PatchRequest {
    pub patch: Value,
}

/// Request body for a batch position write.
#[derive(Debug, Deserialize)]
pub struct PositionsRequest {
    pub updates: Vec<PositionUpdate>,
}

/// Entity types are table-like names: lowercase letters and underscores.
pub fn validate_entity_type(entity_type: &str) -> Result<()> {
    let valid = !entity_type.is_empty()
        && entity_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "invalid entity type: {}",
            entity_type
        )))
    }
}

fn require_object(value: Value, field: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::BadRequest(format!("{} must be a JSON object", field))),
    }
}

/// List every entity of a type in server order.
pub async fn handle_list(pool: &PgPool, entity_type: &str) -> Result<Vec<Entity<Value>>> {
    validate_entity_type(entity_type)?;

    let rows = db::list_entities(pool, entity_type).await?;
    Ok(rows.iter().map(|row| row.to_entity()).collect())
}

/// Create an entity with a server-assigned id.
pub async fn handle_create(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    entity_type: &str,
    request: CreateRequest,
) -> Result<Entity<Value>> {
    validate_entity_type(entity_type)?;
    let payload = Value::Object(require_object(request.payload, "payload")?);

    let row = db::insert_entity(pool, entity_type, &payload).await?;
    let entity = row.to_entity();

    tracing::info!(entity_type = %entity_type, id = %entity.id, "Entity created");

    conn_manager.publish(
        entity_type,
        &row.payload,
        ChangeEvent::Insert {
            entity: entity.clone(),
        },
    );

    Ok(entity)
}

/// Shallow-merge a patch into an entity's payload.
pub async fn handle_update(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    entity_type: &str,
    id: &str,
    request: PatchRequest,
) -> Result<Entity<Value>> {
    validate_entity_type(entity_type)?;
    let patch = require_object(request.patch, "patch")?;

    let row = db::patch_entity(pool, entity_type, id, &patch)
        .await?
        .ok_or_else(|| AppError::NotFound(id.to_string()))?;
    let entity = row.to_entity();

    tracing::debug!(
        entity_type = %entity_type,
        id = %id,
        fields = patch.len(),
        "Entity updated"
    );

    conn_manager.publish(
        entity_type,
        &row.payload,
        ChangeEvent::Update {
            entity: entity.clone(),
        },
    );

    Ok(entity)
}

/// Delete an entity.
pub async fn handle_delete(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    entity_type: &str,
    id: &str,
) -> Result<()> {
    validate_entity_type(entity_type)?;

    let row = db::delete_entity(pool, entity_type, id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.to_string()))?;

    tracing::info!(entity_type = %entity_type, id = %id, "Entity deleted");

    conn_manager.publish(
        entity_type,
        &row.payload,
        ChangeEvent::Delete { id: row.id.clone() },
    );

    Ok(())
}

/// Write several positions atomically. An unknown id fails the whole batch.
pub async fn handle_set_positions(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    entity_type: &str,
    request: PositionsRequest,
) -> Result<()> {
    validate_entity_type(entity_type)?;

    if request.updates.is_empty() {
        return Ok(());
    }

    let rows = match db::set_positions(pool, entity_type, &request.updates).await? {
        PositionsOutcome::Written(rows) => rows,
        PositionsOutcome::Missing(id) => return Err(AppError::NotFound(id)),
    };

    tracing::debug!(
        entity_type = %entity_type,
        count = rows.len(),
        "Positions written"
    );

    for row in &rows {
        conn_manager.publish(
            entity_type,
            &row.payload,
            ChangeEvent::Update {
                entity: row.to_entity(),
            },
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_entity_type() {
        assert!(validate_entity_type("tasks").is_ok());
        assert!(validate_entity_type("journal_entries").is_ok());

        assert!(validate_entity_type("").is_err());
        assert!(validate_entity_type("Tasks").is_err());
        assert!(validate_entity_type("tasks;drop").is_err());
        assert!(validate_entity_type("tasks2").is_err());
    }

    #[test]
    fn test_require_object() {
        let map = require_object(json!({"title": "A"}), "payload").unwrap();
        assert_eq!(map["title"], "A");

        match require_object(json!([1, 2]), "patch") {
            Err(AppError::BadRequest(msg)) => assert_eq!(msg, "patch must be a JSON object"),
            other => panic!("Expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_positions_request_deserialization() {
        let request: PositionsRequest = serde_json::from_value(json!({
            "updates": [{"id": "a", "position": 0}, {"id": "b", "position": 1}]
        }))
        .unwrap();

        assert_eq!(
            request.updates,
            vec![PositionUpdate::new("a", 0), PositionUpdate::new("b", 1)]
        );
    }
}
