//! Request handlers for collection writes and the change feed.

mod collections;
mod websocket;

pub use collections::*;
pub use websocket::*;
