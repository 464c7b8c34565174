//! Entity model shared by every synchronized collection.

use crate::{EntityId, Position, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Prefix reserved for locally generated ids. Server ids never start with it.
pub const PROVISIONAL_PREFIX: &str = "local:";

/// Data carried by an entity.
///
/// Patches are applied field by field: whatever the patch names overwrites
/// the current value, everything else is left alone.
pub trait Payload:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Partial update for this payload.
    type Patch: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Apply a patch in place.
    fn apply_patch(&mut self, patch: &Self::Patch);
}

impl Payload for serde_json::Value {
    type Patch = serde_json::Map<String, serde_json::Value>;

    fn apply_patch(&mut self, patch: &Self::Patch) {
        if !self.is_object() {
            *self = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(fields) = self.as_object_mut() {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// A synchronized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity<T> {
    /// Server id, or a provisional id while the create is in flight
    pub id: EntityId,
    /// Explicit ordering key; `None` falls back to insertion order
    #[serde(default)]
    pub position: Option<Position>,
    /// The entity data
    pub payload: T,
    /// Last modification time (milliseconds since epoch)
    pub updated_at: Timestamp,
}

impl<T> Entity<T> {
    /// Create an unpositioned entity.
    pub fn new(id: impl Into<EntityId>, payload: T, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            position: None,
            payload,
            updated_at,
        }
    }

    /// Set the ordering key.
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Whether this entity still carries a locally generated id.
    pub fn is_provisional(&self) -> bool {
        is_provisional(&self.id)
    }

    /// Convert the payload, keeping id, position and timestamp.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Entity<U>, E> {
        Ok(Entity {
            id: self.id,
            position: self.position,
            payload: f(self.payload)?,
            updated_at: self.updated_at,
        })
    }
}

impl<T: Payload> Entity<T> {
    /// Return a copy with `patch` merged into the payload.
    pub fn patched(&self, patch: &T::Patch, updated_at: Timestamp) -> Self {
        let mut next = self.clone();
        next.payload.apply_patch(patch);
        next.updated_at = updated_at;
        next
    }
}

/// A locally generated placeholder id for an entity whose create is unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisionalId(EntityId);

impl ProvisionalId {
    /// Build a provisional id from a random token.
    pub fn from_token(token: impl AsRef<str>) -> Self {
        Self(format!("{}{}", PROVISIONAL_PREFIX, token.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> EntityId {
        self.0
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ProvisionalId> for EntityId {
    fn from(id: ProvisionalId) -> Self {
        id.0
    }
}

/// Check whether an id was generated locally.
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// A single entry of a batch position write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub id: EntityId,
    pub position: Position,
}

impl PositionUpdate {
    pub fn new(id: impl Into<EntityId>, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }
}
