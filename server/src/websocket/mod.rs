//! WebSocket change stream.
//!
//! Clients connect to `/changes` and receive a message every time an
//! inbound replication batch leaves an item in conflict.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
