//! Change vocabulary.
//!
//! [`Change`] is what the collection store applies to itself. [`ChangeEvent`]
//! is what arrives from the change feed, asynchronously and unordered relative
//! to local mutations.

use crate::{Entity, EntityId, PositionUpdate};
use serde::{Deserialize, Serialize};

/// A mutation of the in-memory list.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// Insert, or replace if the id already exists
    Insert(Entity<T>),
    /// Replace an existing entity; no-op if the id is unknown
    Update(Entity<T>),
    /// Remove an entity; no-op if the id is unknown
    Delete(EntityId),
    /// Move several entities in one step
    SetPositions(Vec<PositionUpdate>),
}

impl<T> Change<T> {
    /// Name of the change kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert(_) => "insert",
            Change::Update(_) => "update",
            Change::Delete(_) => "delete",
            Change::SetPositions(_) => "set_positions",
        }
    }
}

/// A push notification describing a change made elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent<T> {
    Insert { entity: Entity<T> },
    Update { entity: Entity<T> },
    Delete { id: EntityId },
}

impl<T> ChangeEvent<T> {
    /// Id of the entity this event is about.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            ChangeEvent::Insert { entity } | ChangeEvent::Update { entity } => &entity.id,
            ChangeEvent::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }

    /// Convert the payload type, e.g. from raw JSON to a typed payload.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<ChangeEvent<U>, E> {
        Ok(match self {
            ChangeEvent::Insert { entity } => ChangeEvent::Insert {
                entity: entity.try_map(f)?,
            },
            ChangeEvent::Update { entity } => ChangeEvent::Update {
                entity: entity.try_map(f)?,
            },
            ChangeEvent::Delete { id } => ChangeEvent::Delete { id },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn event_wire_format() {
        let event = ChangeEvent::Update {
            entity: Entity::new("t1", json!({"title": "A"}), 10),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["entity"]["id"], "t1");

        let delete: ChangeEvent<Value> =
            serde_json::from_str(r#"{"type":"delete","id":"t2"}"#).unwrap();
        assert_eq!(delete.entity_id(), "t2");
        assert_eq!(delete.kind(), "delete");
    }

    #[test]
    fn try_map_converts_payload() {
        let event = ChangeEvent::Insert {
            entity: Entity::new("t1", json!({"n": 3}), 10).with_position(4),
        };
        let mapped: ChangeEvent<i64> = event
            .try_map(|v| v["n"].as_i64().ok_or("not a number"))
            .unwrap();
        match mapped {
            ChangeEvent::Insert { entity } => {
                assert_eq!(entity.payload, 3);
                assert_eq!(entity.position, Some(4));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn try_map_propagates_error() {
        let event = ChangeEvent::Update {
            entity: Entity::new("t1", json!("text"), 10),
        };
        let mapped: Result<ChangeEvent<i64>, &str> =
            event.try_map(|v| v.as_i64().ok_or("not a number"));
        assert_eq!(mapped.unwrap_err(), "not a number");
    }
}
