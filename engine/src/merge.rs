//! Change-feed merge rules.
//!
//! Events pushed from elsewhere are folded into the store unless a local
//! operation on the same id is still in flight. The acting client's own
//! intent always wins; its confirmation will bring the authoritative state.
//!
//! Inserts of unknown ids are held back while a local create is in flight:
//! the feed usually echoes our own create before its confirmation, and the
//! held row then lands on the renamed entity instead of showing up twice.

use crate::{Change, ChangeEvent, CollectionStore, Entity, OperationKind, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a feed event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    PendingUpdate,
    PendingDelete,
    PendingReorder,
}

impl DiscardReason {
    fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Delete => DiscardReason::PendingDelete,
            OperationKind::Reorder => DiscardReason::PendingReorder,
            OperationKind::Create | OperationKind::Update => DiscardReason::PendingUpdate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::PendingUpdate => "pending_update",
            DiscardReason::PendingDelete => "pending_delete",
            DiscardReason::PendingReorder => "pending_reorder",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of merging one feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The list changed
    Applied,
    /// Nothing to do (e.g. delete of an unknown id)
    Ignored,
    /// Dropped in favour of an in-flight local operation
    Discarded(DiscardReason),
    /// Held until the in-flight local creates settle
    Deferred,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

impl<T: Payload> CollectionStore<T> {
    /// Fold a change-feed event into the list.
    pub fn merge(&mut self, event: ChangeEvent<T>) -> MergeOutcome {
        match event {
            ChangeEvent::Insert { entity } => {
                if self.pending().has_pending_delete(&entity.id) {
                    return MergeOutcome::Discarded(DiscardReason::PendingDelete);
                }
                if self.contains(&entity.id) {
                    // Usually our own create echoed back after confirmation.
                    return self.merge_update(entity);
                }
                if self.pending().has_pending_creates() {
                    self.hold_insert(entity);
                    return MergeOutcome::Deferred;
                }
                self.apply(Change::Insert(entity));
                MergeOutcome::Applied
            }
            ChangeEvent::Update { entity } => self.merge_update(entity),
            ChangeEvent::Delete { id } => {
                if self.pending().has_pending_delete(&id) {
                    return MergeOutcome::Discarded(DiscardReason::PendingDelete);
                }
                let was_held = self.drop_held_insert(&id);
                if self.apply(Change::Delete(id)) {
                    MergeOutcome::Applied
                } else if was_held {
                    MergeOutcome::Deferred
                } else {
                    MergeOutcome::Ignored
                }
            }
        }
    }

    fn merge_update(&mut self, entity: Entity<T>) -> MergeOutcome {
        if let Some(kind) = self.pending().conflicting_kind(&entity.id) {
            return MergeOutcome::Discarded(DiscardReason::for_kind(kind));
        }
        if !self.contains(&entity.id) && self.is_held_insert(&entity.id) {
            self.hold_insert(entity);
            return MergeOutcome::Deferred;
        }
        if self.apply(Change::Update(entity)) {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Ignored
        }
    }

    /// Merge the inserts held back by in-flight creates once none is left.
    pub(crate) fn release_held_inserts(&mut self) {
        if self.pending().has_pending_creates() {
            return;
        }
        for entity in self.take_held_inserts() {
            self.merge(ChangeEvent::Insert { entity });
        }
    }
}
