//! Pending-operation tracking.
//!
//! Every optimistic mutation is registered here under a [`CorrelationId`]
//! until its remote call settles. The tracker is what arbitrates "whose write
//! wins" when a change-feed event races an in-flight local mutation.

use crate::{Entity, EntityId, Payload, Position, PositionUpdate, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one in-flight mutation. Allocated in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Kind of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Reorder,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reorder => "reorder",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ids a pending operation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single entity (create, update, delete)
    Entity(EntityId),
    /// Every member of a reorder
    Batch(Vec<EntityId>),
}

impl Target {
    /// Whether this target includes `id`.
    pub fn covers(&self, id: &str) -> bool {
        match self {
            Target::Entity(target) => target == id,
            Target::Batch(ids) => ids.iter().any(|member| member == id),
        }
    }

    /// Whether this is the single-entity target for `id`.
    pub fn is_entity(&self, id: &str) -> bool {
        matches!(self, Target::Entity(target) if target == id)
    }

    fn rekey(&mut self, old: &str, new: &str) {
        match self {
            Target::Entity(id) if id == old => *id = new.to_string(),
            Target::Entity(_) => {}
            Target::Batch(ids) => {
                for id in ids.iter_mut().filter(|id| id.as_str() == old) {
                    *id = new.to_string();
                }
            }
        }
    }
}

/// Where a reorder member sat before the reorder was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSlot {
    pub id: EntityId,
    pub position: Option<Position>,
    pub index: usize,
}

/// Minimal state needed to undo an optimistic change.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<T> {
    /// The entity did not exist (create)
    Absent,
    /// The entity as it was, and its list index at the time
    Present { entity: Entity<T>, index: usize },
    /// Previous placement of every reorder member
    Ordering(Vec<OrderSlot>),
}

impl<T: Clone> Snapshot<T> {
    /// The entity state captured by this snapshot, if any.
    pub fn entity(&self) -> Option<&Entity<T>> {
        match self {
            Snapshot::Present { entity, .. } => Some(entity),
            _ => None,
        }
    }

    pub(crate) fn index(&self) -> Option<usize> {
        match self {
            Snapshot::Present { index, .. } => Some(*index),
            _ => None,
        }
    }

    fn rekey(&mut self, old: &str, new: &str) {
        match self {
            Snapshot::Absent => {}
            Snapshot::Present { entity, .. } => {
                if entity.id == old {
                    entity.id = new.to_string();
                }
            }
            Snapshot::Ordering(slots) => {
                for slot in slots.iter_mut().filter(|slot| slot.id == old) {
                    slot.id = new.to_string();
                }
            }
        }
    }
}

/// The optimistic delta a pending operation applied.
#[derive(Debug, Clone)]
pub enum PendingChange<T: Payload> {
    Create,
    Update {
        patch: T::Patch,
        updated_at: Timestamp,
    },
    Delete,
    Reorder(Vec<PositionUpdate>),
}

impl<T: Payload> PendingChange<T> {
    pub fn kind(&self) -> OperationKind {
        match self {
            PendingChange::Create => OperationKind::Create,
            PendingChange::Update { .. } => OperationKind::Update,
            PendingChange::Delete => OperationKind::Delete,
            PendingChange::Reorder(_) => OperationKind::Reorder,
        }
    }

    /// Re-run this delta on top of `state`.
    pub(crate) fn replay(&self, state: Option<Entity<T>>) -> Option<Entity<T>> {
        match self {
            PendingChange::Create | PendingChange::Reorder(_) => state,
            PendingChange::Update { patch, updated_at } => {
                state.map(|entity| entity.patched(patch, *updated_at))
            }
            PendingChange::Delete => None,
        }
    }
}

/// An in-flight local mutation.
#[derive(Debug, Clone)]
pub struct PendingOperation<T: Payload> {
    pub correlation_id: CorrelationId,
    pub target: Target,
    pub snapshot_before: Snapshot<T>,
    pub change: PendingChange<T>,
}

impl<T: Payload> PendingOperation<T> {
    pub fn kind(&self) -> OperationKind {
        self.change.kind()
    }

    /// The targeted entity id; `None` for reorders.
    pub fn target_id(&self) -> Option<&EntityId> {
        match &self.target {
            Target::Entity(id) => Some(id),
            Target::Batch(_) => None,
        }
    }
}

/// Registry of in-flight mutations for one collection, kept in issue order.
#[derive(Debug, Clone)]
pub struct PendingTracker<T: Payload> {
    next_id: u64,
    ops: Vec<PendingOperation<T>>,
}

impl<T: Payload> Default for PendingTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> PendingTracker<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ops: Vec::new(),
        }
    }

    /// Register a mutation and return its correlation id.
    pub fn register(
        &mut self,
        target: Target,
        snapshot_before: Snapshot<T>,
        change: PendingChange<T>,
    ) -> CorrelationId {
        let correlation_id = CorrelationId(self.next_id);
        self.next_id += 1;
        self.ops.push(PendingOperation {
            correlation_id,
            target,
            snapshot_before,
            change,
        });
        correlation_id
    }

    /// Remove a settled operation. `None` if it was already resolved.
    pub fn resolve(&mut self, correlation_id: CorrelationId) -> Option<PendingOperation<T>> {
        let index = self
            .ops
            .iter()
            .position(|op| op.correlation_id == correlation_id)?;
        Some(self.ops.remove(index))
    }

    pub fn get(&self, correlation_id: CorrelationId) -> Option<&PendingOperation<T>> {
        self.ops
            .iter()
            .find(|op| op.correlation_id == correlation_id)
    }

    pub(crate) fn get_mut(
        &mut self,
        correlation_id: CorrelationId,
    ) -> Option<&mut PendingOperation<T>> {
        self.ops
            .iter_mut()
            .find(|op| op.correlation_id == correlation_id)
    }

    pub fn is_pending(&self, correlation_id: CorrelationId) -> bool {
        self.get(correlation_id).is_some()
    }

    /// All pending operations in issue order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PendingOperation<T>> {
        self.ops.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingOperation<T>> {
        self.ops.iter_mut()
    }

    /// Pending operations covering `id`, in issue order.
    pub fn for_id<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PendingOperation<T>> {
        self.ops.iter().filter(move |op| op.target.covers(id))
    }

    /// Whether anything at all is in flight for `id`.
    pub fn has_pending(&self, id: &str) -> bool {
        self.for_id(id).next().is_some()
    }

    /// The first in-flight Update, Delete or Reorder covering `id`.
    ///
    /// A change-feed update for such an id must not be applied.
    pub fn conflicting_kind(&self, id: &str) -> Option<OperationKind> {
        self.for_id(id)
            .map(|op| op.kind())
            .find(|kind| *kind != OperationKind::Create)
    }

    pub fn has_pending_delete(&self, id: &str) -> bool {
        self.for_id(id)
            .any(|op| op.kind() == OperationKind::Delete)
    }

    /// Whether any create is still in flight.
    pub fn has_pending_creates(&self) -> bool {
        self.ops.iter().any(|op| op.kind() == OperationKind::Create)
    }

    /// Whether a pending reorder includes `id`.
    pub fn has_pending_reorder(&self, id: &str) -> bool {
        self.for_id(id)
            .any(|op| op.kind() == OperationKind::Reorder)
    }

    /// The in-flight create for a provisional id.
    pub fn pending_create(&self, id: &str) -> Option<CorrelationId> {
        self.for_id(id)
            .find(|op| op.kind() == OperationKind::Create)
            .map(|op| op.correlation_id)
    }

    /// Point every operation that referenced `old` at `new`.
    pub fn rekey(&mut self, old: &str, new: &str) {
        for op in &mut self.ops {
            op.target.rekey(old, new);
            op.snapshot_before.rekey(old, new);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn patch(title: &str) -> Map<String, Value> {
        json!({ "title": title }).as_object().cloned().unwrap()
    }

    fn present(id: &str) -> Snapshot<Value> {
        Snapshot::Present {
            entity: Entity::new(id, json!({"title": "A"}), 1),
            index: 0,
        }
    }

    #[test]
    fn correlation_ids_follow_issue_order() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        let first = tracker.register(
            Target::Entity("a".into()),
            Snapshot::Absent,
            PendingChange::Create,
        );
        let second = tracker.register(Target::Entity("a".into()), present("a"), PendingChange::Delete);
        assert!(first < second);
        assert_eq!(tracker.len(), 2);
        assert_eq!(first.to_string(), "op-1");
    }

    #[test]
    fn iter_walks_both_directions() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        let first = tracker.register(Target::Entity("a".into()), present("a"), PendingChange::Delete);
        let second = tracker.register(Target::Entity("b".into()), present("b"), PendingChange::Delete);

        let newest: Vec<_> = tracker.iter().rev().map(|op| op.correlation_id).collect();
        assert_eq!(newest, vec![second, first]);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        let id = tracker.register(Target::Entity("a".into()), present("a"), PendingChange::Delete);

        assert!(tracker.resolve(id).is_some());
        assert!(tracker.resolve(id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn conflicting_kind_ignores_creates() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        tracker.register(
            Target::Entity("a".into()),
            Snapshot::Absent,
            PendingChange::Create,
        );
        assert_eq!(tracker.conflicting_kind("a"), None);
        assert!(tracker.has_pending("a"));

        tracker.register(
            Target::Entity("a".into()),
            present("a"),
            PendingChange::Update {
                patch: patch("B"),
                updated_at: 2,
            },
        );
        assert_eq!(tracker.conflicting_kind("a"), Some(OperationKind::Update));
        assert!(!tracker.has_pending_delete("a"));
    }

    #[test]
    fn reorder_covers_every_member() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        tracker.register(
            Target::Batch(vec!["a".into(), "b".into()]),
            Snapshot::Ordering(Vec::new()),
            PendingChange::Reorder(vec![PositionUpdate::new("a", 1)]),
        );
        assert_eq!(tracker.conflicting_kind("b"), Some(OperationKind::Reorder));
        assert!(tracker.has_pending_reorder("a"));
        assert_eq!(tracker.conflicting_kind("c"), None);
    }

    #[test]
    fn rekey_rewrites_targets_and_snapshots() {
        let mut tracker: PendingTracker<Value> = PendingTracker::new();
        let create = tracker.register(
            Target::Entity("local:1".into()),
            Snapshot::Absent,
            PendingChange::Create,
        );
        let update = tracker.register(
            Target::Entity("local:1".into()),
            present("local:1"),
            PendingChange::Update {
                patch: patch("B"),
                updated_at: 2,
            },
        );

        tracker.rekey("local:1", "srv-1");

        assert_eq!(tracker.pending_create("srv-1"), Some(create));
        let op = tracker.get(update).unwrap();
        assert_eq!(op.target_id().map(String::as_str), Some("srv-1"));
        assert_eq!(op.snapshot_before.entity().unwrap().id, "srv-1");
        assert!(!tracker.has_pending("local:1"));
    }

    #[test]
    fn replay_applies_delta() {
        let base = Some(Entity::new("a", json!({"title": "A", "done": false}), 1));
        let update: PendingChange<Value> = PendingChange::Update {
            patch: patch("B"),
            updated_at: 9,
        };
        let next = update.replay(base.clone()).unwrap();
        assert_eq!(next.payload, json!({"title": "B", "done": false}));
        assert_eq!(next.updated_at, 9);

        let delete: PendingChange<Value> = PendingChange::Delete;
        assert!(delete.replay(base).is_none());
    }
}
