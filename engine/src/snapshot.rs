//! Read model handed to presentation code.
//!
//! A [`ViewSnapshot`] is an owned copy of everything a view renders: the
//! ordered entities, whether anything is in flight, and the last surfaced
//! failure. It serializes camelCase for hosts that marshal state across a
//! process or language boundary.

use crate::{error::Result, CollectionStore, Entity, Error, Payload, RemoteError};
use serde::{Deserialize, Serialize};

/// Point-in-time state of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot<T> {
    /// Entities in display order
    pub entities: Vec<Entity<T>>,
    /// True while any local mutation is outstanding
    pub is_mutating: bool,
    /// Last surfaced failure, cleared by the next success
    pub error: Option<RemoteError>,
    /// Store revision the snapshot was taken at
    pub revision: u64,
}

impl<T> Default for ViewSnapshot<T> {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            is_mutating: false,
            error: None,
            revision: 0,
        }
    }
}

impl<T: Payload> ViewSnapshot<T> {
    /// Copy the current state of `store`.
    pub fn capture(store: &CollectionStore<T>, error: Option<RemoteError>) -> Self {
        Self {
            entities: store.entities().to_vec(),
            is_mutating: store.is_mutating(),
            error,
            revision: store.revision(),
        }
    }

    /// Look up an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity<T>> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entities.iter().map(|entity| entity.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn capture_reflects_store() {
        let mut store: CollectionStore<Value> = CollectionStore::with_entities(vec![
            Entity::new("a", json!({"title": "A"}), 1).with_position(0),
        ]);
        store
            .begin_create(Entity::new("local:1", json!({"title": "B"}), 2))
            .unwrap();

        let view = ViewSnapshot::capture(&store, Some(RemoteError::new("boom")));

        assert_eq!(view.ids(), vec!["local:1", "a"]);
        assert!(view.is_mutating);
        assert_eq!(view.error.as_ref().unwrap().message, "boom");
        assert_eq!(view.revision, store.revision());
        assert_eq!(view.get("a").unwrap().payload["title"], "A");
    }

    #[test]
    fn json_format_is_camel_case() {
        let view: ViewSnapshot<Value> = ViewSnapshot::default();
        let json = view.to_json().unwrap();
        assert!(json.contains("isMutating"));

        let parsed: ViewSnapshot<Value> = ViewSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, view);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let result: Result<ViewSnapshot<Value>> = ViewSnapshot::from_json("{");
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }
}
