//! # Rebound Engine
//!
//! A deterministic optimistic-update engine for client-side collections.
//!
//! This crate holds the state machine behind a responsive client: local
//! mutations are applied immediately, reconciled when the server confirms
//! them, rolled back when it refuses them, and merged with changes pushed
//! from elsewhere without ever letting a stale remote snapshot overwrite an
//! in-flight local edit.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about networks, timers or threads
//! - **Deterministic**: every input, including "now", is passed in
//! - **Synchronous**: a read right after a mutation observes it
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] is an id, an optional ordering [`Position`], a typed
//! [`Payload`] and an `updated_at` timestamp. Entities created locally carry
//! a [`ProvisionalId`] until the server assigns the real one.
//!
//! ### Pending operations
//!
//! Every optimistic mutation is registered with the [`PendingTracker`] under
//! a [`CorrelationId`], together with the snapshot needed to undo it.
//!
//! ### Collection store
//!
//! The [`CollectionStore`] owns the ordered list and the tracker. It applies
//! changes, rolls back failed operations, settles confirmed ones and merges
//! [`ChangeEvent`]s from the change feed under the local-intent-priority rule.
//!
//! ## Quick Start
//!
//! ```rust
//! use rebound_engine::{plan_reorder, CollectionStore, Entity, MergeOutcome, ChangeEvent};
//! use serde_json::json;
//!
//! let mut store = CollectionStore::with_entities(vec![
//!     Entity::new("a", json!({"title": "Write report"}), 1000).with_position(0),
//!     Entity::new("b", json!({"title": "Review PR"}), 1000).with_position(1),
//! ]);
//!
//! // Edit optimistically; the change is visible at once.
//! let patch = json!({"title": "Write final report"}).as_object().cloned().unwrap();
//! let op = store.begin_update("a", patch, 2000).unwrap();
//! assert_eq!(store.get("a").unwrap().payload["title"], "Write final report");
//!
//! // A stale push for the same entity is dropped while the edit is in flight.
//! let stale = ChangeEvent::Update {
//!     entity: Entity::new("a", json!({"title": "Write report"}), 1500).with_position(0),
//! };
//! assert!(matches!(store.merge(stale), MergeOutcome::Discarded(_)));
//!
//! // The server refused the edit: undo it.
//! store.rollback(op);
//! assert_eq!(store.get("a").unwrap().payload["title"], "Write report");
//!
//! // Reorders are planned as a minimal batch of position writes.
//! let plan = plan_reorder(&store, &["b".to_string(), "a".to_string()]).unwrap();
//! assert_eq!(plan.updates.len(), 2);
//! ```

pub mod change;
pub mod clock;
pub mod collection;
pub mod entity;
pub mod error;
pub mod merge;
pub mod pending;
pub mod reorder;
pub mod snapshot;

// Re-export main types at crate root
pub use change::{Change, ChangeEvent};
pub use clock::{Clock, ManualClock};
pub use collection::{CollectionStore, Settlement};
pub use entity::{is_provisional, Entity, Payload, PositionUpdate, ProvisionalId, PROVISIONAL_PREFIX};
pub use error::{Error, RemoteError};
pub use merge::{DiscardReason, MergeOutcome};
pub use pending::{
    CorrelationId, OperationKind, OrderSlot, PendingChange, PendingOperation, PendingTracker,
    Snapshot, Target,
};
pub use reorder::{plan_reorder, ReorderPlan};
pub use snapshot::ViewSnapshot;

/// Type aliases for clarity
pub type EntityId = String;
pub type Position = i64;
pub type Timestamp = u64;
