//! Reorder planning.
//!
//! A reorder is expressed as the desired order of ids. Each listed id gets
//! its index as its position; only the ids whose position actually changes
//! end up in the batch sent to the remote store.

use crate::{
    error::Result, is_provisional, CollectionStore, EntityId, Error, Payload, Position,
    PositionUpdate,
};
use std::collections::HashSet;

/// The position writes a reorder needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReorderPlan {
    /// Every id named by the reorder, in the requested order
    pub members: Vec<EntityId>,
    /// Minimal batch of position changes
    pub updates: Vec<PositionUpdate>,
}

impl ReorderPlan {
    /// Whether the reorder moves nothing.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Compute the minimal position batch that realizes `ordered_ids`.
///
/// Ids not listed keep their current position.
pub fn plan_reorder<T: Payload>(
    store: &CollectionStore<T>,
    ordered_ids: &[EntityId],
) -> Result<ReorderPlan> {
    let mut seen = HashSet::with_capacity(ordered_ids.len());
    let mut updates = Vec::new();

    for (index, id) in ordered_ids.iter().enumerate() {
        if !seen.insert(id.as_str()) {
            return Err(Error::InvalidReorder(format!("duplicate id: {}", id)));
        }
        if is_provisional(id) {
            return Err(Error::InvalidReorder(format!("{} is not yet confirmed", id)));
        }
        let entity = store
            .get(id)
            .ok_or_else(|| Error::EntityNotFound(id.clone()))?;

        let position = index as Position;
        if entity.position != Some(position) {
            updates.push(PositionUpdate::new(id.clone(), position));
        }
    }

    Ok(ReorderPlan {
        members: ordered_ids.to_vec(),
        updates,
    })
}
