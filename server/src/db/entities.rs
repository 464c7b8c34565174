//! Queries over the `entities` table.

use rebound_engine::{Entity, PositionUpdate};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};

/// Columns selected for every entity query.
const COLUMNS: &str = "id, position, payload, updated_at";

/// A stored entity row from the database.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: String,
    pub position: Option<i64>,
    pub payload: Value,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEntity {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            id: row.try_get("id")?,
            position: row.try_get("position")?,
            payload: row.try_get("payload")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredEntity {
    /// Convert the row to its wire form.
    pub fn to_entity(&self) -> Entity<Value> {
        Entity {
            id: self.id.clone(),
            position: self.position,
            payload: self.payload.clone(),
            updated_at: self.updated_at.max(0) as u64,
        }
    }
}

/// Result of a batch position write.
#[derive(Debug)]
pub enum PositionsOutcome {
    /// Every row was written; the updated rows in request order
    Written(Vec<StoredEntity>),
    /// An id did not exist; nothing was written
    Missing(String),
}

/// Current time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// All entities of a type: unpositioned newest first, then by position.
pub async fn list_entities(pool: &PgPool, entity_type: &str) -> Result<Vec<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM entities
        WHERE entity_type = $1
        ORDER BY (position IS NOT NULL), position ASC, created_at DESC, id ASC
        "#
    ))
    .bind(entity_type)
    .fetch_all(pool)
    .await
}

/// Insert a new entity with a server-assigned id.
pub async fn insert_entity(
    pool: &PgPool,
    entity_type: &str,
    payload: &Value,
) -> Result<StoredEntity, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();

    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        INSERT INTO entities (id, entity_type, position, payload, created_at, updated_at)
        VALUES ($1, $2, NULL, $3, $4, $4)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&id)
    .bind(entity_type)
    .bind(payload)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Shallow-merge `patch` into the stored payload.
pub async fn patch_entity(
    pool: &PgPool,
    entity_type: &str,
    id: &str,
    patch: &Map<String, Value>,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        UPDATE entities
        SET payload = payload || $3, updated_at = $4
        WHERE entity_type = $1 AND id = $2
        RETURNING {COLUMNS}
        "#
    ))
    .bind(entity_type)
    .bind(id)
    .bind(Value::Object(patch.clone()))
    .bind(now_millis())
    .fetch_optional(pool)
    .await
}

/// Delete an entity, returning the removed row.
pub async fn delete_entity(
    pool: &PgPool,
    entity_type: &str,
    id: &str,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        DELETE FROM entities
        WHERE entity_type = $1 AND id = $2
        RETURNING {COLUMNS}
        "#
    ))
    .bind(entity_type)
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Write several positions in one transaction. Either every row is written
/// or none is.
pub async fn set_positions(
    pool: &PgPool,
    entity_type: &str,
    updates: &[PositionUpdate],
) -> Result<PositionsOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = now_millis();
    let mut written = Vec::with_capacity(updates.len());

    for update in updates {
        let row = sqlx::query_as::<_, StoredEntity>(&format!(
            r#"
            UPDATE entities
            SET position = $3, updated_at = $4
            WHERE entity_type = $1 AND id = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(entity_type)
        .bind(&update.id)
        .bind(update.position)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => written.push(row),
            None => {
                tx.rollback().await?;
                return Ok(PositionsOutcome::Missing(update.id.clone()));
            }
        }
    }

    tx.commit().await?;
    Ok(PositionsOutcome::Written(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_entity_to_entity() {
        let stored = StoredEntity {
            id: "t1".into(),
            position: Some(3),
            payload: json!({"title": "A"}),
            updated_at: 2000,
        };

        let entity = stored.to_entity();
        assert_eq!(entity.id, "t1");
        assert_eq!(entity.position, Some(3));
        assert_eq!(entity.payload["title"], "A");
        assert_eq!(entity.updated_at, 2000);
    }

    #[test]
    fn test_now_millis_is_recent() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
