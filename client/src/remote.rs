//! Remote store contract.
//!
//! The durable side of a collection. Every call is request/response and
//! fails with a [`RemoteError`] carrying the server's message. Timeouts and
//! transport failures are the implementation's business and surface the
//! same way.

use async_trait::async_trait;
use rebound_engine::{Entity, Payload, PositionUpdate};

use crate::error::RemoteError;

/// CRUD and batch-reorder access to one entity type.
#[async_trait]
pub trait RemoteStore<T: Payload>: Send + Sync {
    /// Every entity of this type, in server order. Used for initial load and
    /// desync recovery.
    async fn list(&self) -> Result<Vec<Entity<T>>, RemoteError>;

    /// Create an entity; the server assigns id and timestamp.
    async fn create(&self, payload: &T) -> Result<Entity<T>, RemoteError>;

    /// Apply a field-level patch and return the stored row.
    async fn update(&self, id: &str, patch: &T::Patch) -> Result<Entity<T>, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// Write several positions in one request. A failed call may have
    /// written some of them; callers treat it as failed as a whole.
    async fn batch_set_positions(&self, updates: &[PositionUpdate]) -> Result<(), RemoteError>;
}
