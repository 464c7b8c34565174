//! WebSocket change feed.
//!
//! Clients subscribe per entity type, optionally filtered on a payload
//! field, and receive every committed write that matches, including their
//! own.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
