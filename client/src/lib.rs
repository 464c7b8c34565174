//! # Rebound Client
//!
//! Async synchronization layer around [`rebound_engine`].
//!
//! A [`SyncedCollection`] applies every mutation locally before the server
//! answers, settles or rolls it back when the answer arrives, and merges the
//! change feed under local-intent priority: an in-flight local operation
//! always wins over a concurrent remote event for the same entity.
//!
//! ## Seams
//!
//! - [`RemoteStore`]: request/response persistence, one adapter per entity
//!   type. [`HttpRemoteStore`] talks to the reference server,
//!   [`MemoryRemoteStore`] to an in-process [`MemoryBackend`].
//! - [`ChangeFeed`]: pushed insert/update/delete events. [`WebSocketFeed`]
//!   multiplexes subscriptions over one connection; [`MemoryBackend`] is a
//!   feed too.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rebound_client::{MemoryBackend, Session, Task, TaskPatch};
//!
//! # async fn demo() -> Result<(), rebound_client::SyncError> {
//! let backend = MemoryBackend::new();
//! let session = Session::in_memory("user-1", &backend);
//! session.start().await?;
//!
//! let task = session.tasks.create(Task::new("user-1", "Write report")).await?;
//! session.tasks.update(&task.id, TaskPatch::completed(true)).await?;
//!
//! session.sign_out().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collection;
pub mod config;
pub mod entities;
pub mod error;
pub mod feed;
pub mod http;
pub mod memory;
pub mod remote;
pub mod session;
pub mod ws;

pub use clock::SystemClock;
pub use collection::SyncedCollection;
pub use config::ClientConfig;
pub use entities::{Goal, GoalPatch, JournalEntry, JournalEntryPatch, Task, TaskPatch};
pub use error::{ConfigError, FeedError, RemoteError, SyncError};
pub use feed::{ChangeFeed, FeedFilter, Subscription, SubscriptionId};
pub use http::HttpRemoteStore;
pub use memory::{MemoryBackend, MemoryRemoteStore};
pub use remote::RemoteStore;
pub use session::{ConnectError, Remotes, Session};
pub use ws::WebSocketFeed;

pub use rebound_engine::{
    ChangeEvent, DiscardReason, Entity, EntityId, MergeOutcome, Payload, Position,
    PositionUpdate, ViewSnapshot,
};
