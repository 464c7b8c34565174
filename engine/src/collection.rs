//! Collection store - the ordered in-memory list for one entity type.
//!
//! The store owns the authoritative local list plus the pending operations
//! that produced its optimistic state. All mutation is synchronous: a read
//! right after any call observes the new state.
//!
//! # Ordering
//!
//! Unpositioned entities come first, in insertion order (creates prepend).
//! Positioned entities follow, sorted by `(position, id)` ascending.
//!
//! # Settlement
//!
//! When an operation settles, the later operations pending on the same id are
//! replayed on top of the settled state and their snapshots are recomputed.
//! On success the settled delta is also folded into the snapshots of earlier
//! operations still pending. One failure therefore undoes only its own delta,
//! whatever order the remote calls come back in.

use crate::{
    error::Result, Change, CorrelationId, Entity, EntityId, Error, OperationKind, OrderSlot,
    Payload, PendingChange, PendingTracker, Position, PositionUpdate, ReorderPlan, Snapshot,
    Target, Timestamp,
};
use std::collections::{HashMap, HashSet};

/// What a confirmation did to the visible list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The local entity now reflects the settled state
    Applied,
    /// The entity is gone locally; nothing was written
    Stale,
    /// The operation had already been resolved
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct WriteMode {
    /// Reinsert the entity if it is missing locally
    allow_insert: bool,
    /// Keep the local position instead of the incoming one
    keep_position: bool,
}

/// The ordered, deduplicated list of one entity type.
#[derive(Debug, Clone)]
pub struct CollectionStore<T: Payload> {
    entities: Vec<Entity<T>>,
    pending: PendingTracker<T>,
    revision: u64,
    /// Feed inserts waiting for in-flight creates to settle
    held_inserts: Vec<Entity<T>>,
}

impl<T: Payload> Default for CollectionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> CollectionStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            pending: PendingTracker::new(),
            revision: 0,
            held_inserts: Vec::new(),
        }
    }

    /// Create a store holding `entities`.
    pub fn with_entities(entities: Vec<Entity<T>>) -> Self {
        let mut store = Self::new();
        store.hydrate(entities);
        store
    }

    /// The ordered list.
    pub fn entities(&self) -> &[Entity<T>] {
        &self.entities
    }

    pub fn get(&self, id: &str) -> Option<&Entity<T>> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|entity| entity.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    /// Ids in list order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|entity| entity.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// In-flight local mutations.
    pub fn pending(&self) -> &PendingTracker<T> {
        &self.pending
    }

    /// Whether any local mutation is still in flight.
    pub fn is_mutating(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Bumped on every visible change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply a change to the list. Returns whether anything changed.
    pub fn apply(&mut self, change: Change<T>) -> bool {
        let changed = match change {
            Change::Insert(entity) => match self.index_of(&entity.id) {
                Some(index) => self.put_at(index, entity),
                None => {
                    self.insert_sorted(entity, None);
                    true
                }
            },
            Change::Update(entity) => match self.index_of(&entity.id) {
                Some(index) => self.put_at(index, entity),
                None => false,
            },
            Change::Delete(id) => self.remove(&id).is_some(),
            Change::SetPositions(updates) => self.set_positions(&updates),
        };

        if changed {
            self.touch();
        }
        changed
    }

    /// Undo a pending operation and resolve it.
    ///
    /// Returns `false`, and leaves the list untouched, if the operation was
    /// already resolved.
    pub fn rollback(&mut self, correlation_id: CorrelationId) -> bool {
        let Some(op) = self.pending.resolve(correlation_id) else {
            return false;
        };

        let kind = op.kind();
        match op.target {
            Target::Batch(_) => {
                if let Snapshot::Ordering(slots) = &op.snapshot_before {
                    self.restore_ordering(slots);
                }
                self.replay_reorders_after(correlation_id);
            }
            Target::Entity(id) => {
                let index = op.snapshot_before.index();
                let base = op.snapshot_before.entity().cloned();
                let mode = WriteMode {
                    allow_insert: kind == OperationKind::Delete,
                    keep_position: true,
                };
                self.rebase(&id, correlation_id, base, index, mode);
            }
        }

        self.touch();
        if kind == OperationKind::Create {
            self.release_held_inserts();
        }
        true
    }

    /// Rename a provisional entity to its server id.
    ///
    /// Position and local edits are kept. If the server id is already present
    /// (the change feed delivered the insert before the confirmation), that
    /// copy is dropped in favour of the local one. Pending operations are
    /// re-pointed even when the entity itself is gone.
    pub fn replace_provisional_id(&mut self, old_id: &str, new_id: &str) -> bool {
        if old_id == new_id {
            return false;
        }
        self.pending.rekey(old_id, new_id);

        let Some(mut index) = self.index_of(old_id) else {
            return false;
        };
        if let Some(duplicate) = self.index_of(new_id) {
            self.entities.remove(duplicate);
            if duplicate < index {
                index -= 1;
            }
        }
        self.entities[index].id = new_id.to_string();
        self.touch();
        true
    }

    /// Replace the whole list, e.g. on initial load or desync recovery.
    ///
    /// Entities with in-flight local operations keep their local state, and
    /// provisional entities are kept. Duplicate ids in `entities` are ignored
    /// after the first.
    pub fn hydrate(&mut self, entities: Vec<Entity<T>>) {
        let previous = std::mem::take(&mut self.entities);
        let mut retained: Vec<Option<Entity<T>>> = Vec::new();
        let mut retained_index: HashMap<EntityId, usize> = HashMap::new();

        for entity in previous {
            if entity.is_provisional() {
                self.entities.push(entity);
            } else if self.pending.has_pending(&entity.id) {
                retained_index.insert(entity.id.clone(), retained.len());
                retained.push(Some(entity));
            }
        }

        let mut seen = HashSet::new();
        for entity in entities {
            if entity.is_provisional() || !seen.insert(entity.id.clone()) {
                continue;
            }
            let entity = if self.pending.has_pending(&entity.id) {
                match retained_index
                    .get(&entity.id)
                    .and_then(|&slot| retained[slot].take())
                {
                    Some(local) => local,
                    // Gone locally because of an in-flight delete.
                    None => continue,
                }
            } else {
                entity
            };
            self.insert_sorted(entity, Some(usize::MAX));
        }

        for entity in retained.into_iter().flatten() {
            self.insert_sorted(entity, Some(usize::MAX));
        }
        self.touch();
    }

    /// Optimistically insert a new entity and register its create.
    pub fn begin_create(&mut self, entity: Entity<T>) -> Result<CorrelationId> {
        if self.contains(&entity.id) {
            return Err(Error::DuplicateEntity(entity.id));
        }
        let id = entity.id.clone();
        self.insert_sorted(entity, None);
        let correlation_id =
            self.pending
                .register(Target::Entity(id), Snapshot::Absent, PendingChange::Create);
        self.touch();
        Ok(correlation_id)
    }

    /// Optimistically patch an entity and register the update.
    ///
    /// The snapshot is taken from the current, possibly already optimistic,
    /// state so chained edits compose.
    pub fn begin_update(
        &mut self,
        id: &str,
        patch: T::Patch,
        now: Timestamp,
    ) -> Result<CorrelationId> {
        let index = self
            .index_of(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        let before = self.entities[index].clone();
        self.entities[index] = before.patched(&patch, now);

        let correlation_id = self.pending.register(
            Target::Entity(id.to_string()),
            Snapshot::Present {
                entity: before,
                index,
            },
            PendingChange::Update {
                patch,
                updated_at: now,
            },
        );
        self.touch();
        Ok(correlation_id)
    }

    /// Optimistically remove an entity and register the delete.
    pub fn begin_delete(&mut self, id: &str) -> Result<CorrelationId> {
        let (entity, index) = self
            .remove(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let correlation_id = self.pending.register(
            Target::Entity(id.to_string()),
            Snapshot::Present { entity, index },
            PendingChange::Delete,
        );
        self.touch();
        Ok(correlation_id)
    }

    /// Apply a reorder plan in one step and register it.
    ///
    /// Returns `None` when the plan moves nothing.
    pub fn begin_reorder(&mut self, plan: ReorderPlan) -> Option<CorrelationId> {
        if plan.is_empty() {
            return None;
        }
        let slots = self.order_slots(&plan.members);
        self.set_positions(&plan.updates);

        let correlation_id = self.pending.register(
            Target::Batch(plan.members),
            Snapshot::Ordering(slots),
            PendingChange::Reorder(plan.updates),
        );
        self.touch();
        Some(correlation_id)
    }

    /// Settle a create with the server's row.
    pub fn confirm_create(
        &mut self,
        correlation_id: CorrelationId,
        mut authoritative: Entity<T>,
    ) -> Settlement {
        let Some(op) = self.pending.resolve(correlation_id) else {
            return Settlement::Unknown;
        };
        let Some(old_id) = op.target_id() else {
            return Settlement::Unknown;
        };

        let new_id = authoritative.id.clone();
        self.replace_provisional_id(old_id, &new_id);
        if authoritative.position.is_none() {
            authoritative.position = self.get(&new_id).and_then(|local| local.position);
        }
        let settlement = self.settle_entity(&new_id, correlation_id, authoritative);
        self.release_held_inserts();
        settlement
    }

    /// Settle an update with the server's row.
    pub fn confirm_update(
        &mut self,
        correlation_id: CorrelationId,
        authoritative: Entity<T>,
    ) -> Settlement {
        let Some(op) = self.pending.resolve(correlation_id) else {
            return Settlement::Unknown;
        };
        let Target::Entity(id) = op.target else {
            return Settlement::Unknown;
        };

        self.fold_into_earlier(&id, correlation_id, &op.change);
        self.settle_entity(&id, correlation_id, authoritative)
    }

    /// Settle an operation that carries no server row (delete, reorder).
    pub fn confirm(&mut self, correlation_id: CorrelationId) -> Settlement {
        let Some(op) = self.pending.resolve(correlation_id) else {
            return Settlement::Unknown;
        };

        match (&op.target, &op.change) {
            (Target::Batch(_), PendingChange::Reorder(updates)) => {
                self.fold_reorder_into_earlier(correlation_id, updates);
            }
            (Target::Entity(id), change) => {
                self.fold_into_earlier(id, correlation_id, change);
            }
            _ => {}
        }

        // Resolving changes `is_mutating`.
        self.touch();
        Settlement::Applied
    }

    fn settle_entity(
        &mut self,
        id: &str,
        correlation_id: CorrelationId,
        mut authoritative: Entity<T>,
    ) -> Settlement {
        let present = self.contains(id);
        authoritative.id = id.to_string();
        let mode = WriteMode {
            allow_insert: false,
            keep_position: self.pending.has_pending_reorder(id),
        };
        self.rebase(id, correlation_id, Some(authoritative), None, mode);
        self.touch();

        if present {
            Settlement::Applied
        } else {
            Settlement::Stale
        }
    }

    /// Recompute state for `id` from `base`, replaying the operations issued
    /// after `after` that are still pending, and write the result.
    fn rebase(
        &mut self,
        id: &str,
        after: CorrelationId,
        base: Option<Entity<T>>,
        base_index: Option<usize>,
        mode: WriteMode,
    ) -> bool {
        let fallback_index = base_index.or_else(|| self.index_of(id)).unwrap_or(0);
        let mut state = base;

        for op in self
            .pending
            .iter_mut()
            .filter(|op| op.correlation_id > after && op.target.is_entity(id))
        {
            let index = op.snapshot_before.index().unwrap_or(fallback_index);
            let previous_position = op.snapshot_before.entity().map(|entity| entity.position);
            if let (Some(entity), Some(position), true) =
                (state.as_mut(), previous_position, mode.keep_position)
            {
                entity.position = position;
            }
            op.snapshot_before = match &state {
                Some(entity) => Snapshot::Present {
                    entity: entity.clone(),
                    index,
                },
                None => Snapshot::Absent,
            };
            state = op.change.replay(state);
        }

        self.write_state(id, state, fallback_index, mode)
    }

    fn write_state(
        &mut self,
        id: &str,
        state: Option<Entity<T>>,
        index: usize,
        mode: WriteMode,
    ) -> bool {
        match (self.index_of(id), state) {
            (Some(current), None) => {
                self.entities.remove(current);
                true
            }
            (None, None) => false,
            (Some(current), Some(mut entity)) => {
                entity.id = id.to_string();
                if mode.keep_position {
                    entity.position = self.entities[current].position;
                }
                self.put_at(current, entity)
            }
            (None, Some(mut entity)) if mode.allow_insert => {
                entity.id = id.to_string();
                self.insert_sorted(entity, Some(index));
                true
            }
            (None, Some(_)) => false,
        }
    }

    /// Make earlier pending operations on `id` see a now-durable delta, so
    /// rolling them back later keeps it.
    fn fold_into_earlier(&mut self, id: &str, before: CorrelationId, change: &PendingChange<T>) {
        for op in self
            .pending
            .iter_mut()
            .filter(|op| op.correlation_id < before && op.target.is_entity(id))
        {
            let Some(entity) = op.snapshot_before.entity().cloned() else {
                continue;
            };
            let index = op.snapshot_before.index().unwrap_or(0);
            op.snapshot_before = match change.replay(Some(entity)) {
                Some(entity) => Snapshot::Present { entity, index },
                None => Snapshot::Absent,
            };
        }
    }

    fn fold_reorder_into_earlier(&mut self, before: CorrelationId, updates: &[PositionUpdate]) {
        for op in self
            .pending
            .iter_mut()
            .filter(|op| op.correlation_id < before)
        {
            if let Snapshot::Ordering(slots) = &mut op.snapshot_before {
                for slot in slots.iter_mut() {
                    if let Some(update) = updates.iter().find(|update| update.id == slot.id) {
                        slot.position = Some(update.position);
                    }
                }
            }
        }
    }

    fn replay_reorders_after(&mut self, after: CorrelationId) {
        let later: Vec<(CorrelationId, Vec<EntityId>, Vec<PositionUpdate>)> = self
            .pending
            .iter()
            .filter(|op| op.correlation_id > after)
            .filter_map(|op| match (&op.target, &op.change) {
                (Target::Batch(members), PendingChange::Reorder(updates)) => {
                    Some((op.correlation_id, members.clone(), updates.clone()))
                }
                _ => None,
            })
            .collect();

        for (correlation_id, members, updates) in later {
            let slots = self.order_slots(&members);
            if let Some(op) = self.pending.get_mut(correlation_id) {
                op.snapshot_before = Snapshot::Ordering(slots);
            }
            for update in &updates {
                if !self.contains(&update.id) {
                    self.set_snapshot_position(&update.id, Some(update.position));
                }
            }
            self.set_positions(&updates);
        }
    }

    fn restore_ordering(&mut self, slots: &[OrderSlot]) {
        let mut restored: Vec<(usize, Entity<T>)> = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.remove(&slot.id) {
                Some((mut entity, _)) => {
                    entity.position = slot.position;
                    restored.push((slot.index, entity));
                }
                // Deleted meanwhile; a rollback of that delete must land
                // back at the pre-reorder position.
                None => self.set_snapshot_position(&slot.id, slot.position),
            }
        }
        restored.sort_by_key(|(index, _)| *index);
        for (index, entity) in restored {
            self.insert_sorted(entity, Some(index));
        }
    }

    /// Current placement of `members`. A member removed by a pending delete
    /// is placed where that delete would restore it.
    fn order_slots(&self, members: &[EntityId]) -> Vec<OrderSlot> {
        members
            .iter()
            .filter_map(|id| match self.index_of(id) {
                Some(index) => Some(OrderSlot {
                    id: id.clone(),
                    position: self.entities[index].position,
                    index,
                }),
                None => self.pending_slot(id),
            })
            .collect()
    }

    pub(crate) fn hold_insert(&mut self, entity: Entity<T>) {
        match self.held_inserts.iter_mut().find(|held| held.id == entity.id) {
            Some(held) => *held = entity,
            None => self.held_inserts.push(entity),
        }
    }

    pub(crate) fn is_held_insert(&self, id: &str) -> bool {
        self.held_inserts.iter().any(|held| held.id == id)
    }

    pub(crate) fn drop_held_insert(&mut self, id: &str) -> bool {
        let before = self.held_inserts.len();
        self.held_inserts.retain(|held| held.id != id);
        self.held_inserts.len() != before
    }

    pub(crate) fn take_held_inserts(&mut self) -> Vec<Entity<T>> {
        std::mem::take(&mut self.held_inserts)
    }

    fn pending_slot(&self, id: &str) -> Option<OrderSlot> {
        self.pending
            .iter()
            .rev()
            .filter(|op| op.target.is_entity(id))
            .find_map(|op| match &op.snapshot_before {
                Snapshot::Present { entity, index } => Some(OrderSlot {
                    id: id.to_string(),
                    position: entity.position,
                    index: *index,
                }),
                _ => None,
            })
    }

    fn set_snapshot_position(&mut self, id: &str, position: Option<Position>) {
        for op in self
            .pending
            .iter_mut()
            .filter(|op| op.target.is_entity(id))
        {
            if let Snapshot::Present { entity, .. } = &mut op.snapshot_before {
                entity.position = position;
            }
        }
    }

    fn set_positions(&mut self, updates: &[PositionUpdate]) -> bool {
        let mut moved = Vec::new();
        for update in updates {
            if let Some(index) = self.index_of(&update.id) {
                if self.entities[index].position != Some(update.position) {
                    let mut entity = self.entities.remove(index);
                    entity.position = Some(update.position);
                    moved.push(entity);
                }
            }
        }

        let changed = !moved.is_empty();
        for entity in moved {
            self.insert_sorted(entity, None);
        }
        changed
    }

    fn unpositioned_len(&self) -> usize {
        self.entities
            .iter()
            .take_while(|entity| entity.position.is_none())
            .count()
    }

    /// Insert keeping the ordering invariant. `preferred` is the index an
    /// unpositioned entity should land at (front when `None`).
    fn insert_sorted(&mut self, entity: Entity<T>, preferred: Option<usize>) {
        let unpositioned = self.unpositioned_len();
        let index = match entity.position {
            None => preferred.unwrap_or(0).min(unpositioned),
            Some(position) => {
                let key = (Some(position), entity.id.as_str());
                unpositioned
                    + self.entities[unpositioned..]
                        .partition_point(|other| (other.position, other.id.as_str()) < key)
            }
        };
        self.entities.insert(index, entity);
    }

    fn put_at(&mut self, index: usize, entity: Entity<T>) -> bool {
        if self.entities[index].position == entity.position {
            self.entities[index] = entity;
        } else {
            self.entities.remove(index);
            self.insert_sorted(entity, Some(index));
        }
        true
    }

    fn remove(&mut self, id: &str) -> Option<(Entity<T>, usize)> {
        let index = self.index_of(id)?;
        Some((self.entities.remove(index), index))
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}
