//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by a snake_case `type` field.

use serde::{Deserialize, Serialize};
use tangle_engine::ReplicationConflictNotification;

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping {
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An item entered or stayed in conflict after an inbound batch.
    /// Sent to every connection once the batch commits.
    ReplicationConflict(ReplicationConflictNotification),

    /// Response to ping.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Error message.
    Error {
        /// Error description
        message: String,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<&ReplicationConflictNotification> for ServerMessage {
    fn from(notification: &ReplicationConflictNotification) -> Self {
        ServerMessage::ReplicationConflict(notification.clone())
    }
}
