//! WebSocket connection manager.
//!
//! Tracks active `/changes` connections and fans conflict notifications
//! out to them.

use std::sync::Arc;

use dashmap::DashMap;
use tangle_engine::{ConflictSubscriber, ReplicationConflictNotification};
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Name the client connected with
    pub client: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs by client name.
    by_client: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, client: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                client: client.clone(),
                sender,
            },
        );
        self.by_client
            .entry(client)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_client.get_mut(&conn.client) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_client.remove(&conn.client);
                }
            }

            tracing::info!(conn_id = %conn_id, client = %conn.client, "WebSocket connection unregistered");
        }
    }

    /// Broadcast a message to all connections.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_all(&self, message: ServerMessage) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct client names connected.
    #[allow(dead_code)]
    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }
}

impl ConflictSubscriber for ConnectionManager {
    fn on_conflict(&self, notification: &ReplicationConflictNotification) {
        let sent = self.broadcast_all(ServerMessage::from(notification));
        tracing::debug!(
            key = %notification.id,
            conflicts = notification.conflicts.len(),
            recipients = sent,
            "Broadcast replication conflict"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_engine::{Etag, ReplicatedItemType, ReplicationOperation};

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register("dashboard".to_string(), tx);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.client_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.client_count(), 0);
    }

    #[test]
    fn test_broadcast_all_skips_closed_connections() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        manager.register("a".to_string(), tx1);
        manager.register("b".to_string(), tx2);
        drop(rx2);

        let sent = manager.broadcast_all(ServerMessage::Pong { request_id: None });
        assert_eq!(sent, 1);
        assert!(matches!(rx1.try_recv().unwrap(), ServerMessage::Pong { .. }));
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_to("missing", ServerMessage::error("x")));
    }

    #[test]
    fn test_conflicts_reach_every_connection() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("a".to_string(), tx1);
        manager.register("a".to_string(), tx2);
        assert_eq!(manager.client_count(), 1);

        manager.on_conflict(&ReplicationConflictNotification {
            item_type: ReplicatedItemType::Attachment,
            id: "img/1".into(),
            etag: Etag::new(3),
            operation: ReplicationOperation::Delete,
            conflicts: vec!["img/1/conflicts/db-a".into()],
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                ServerMessage::ReplicationConflict(n) => assert_eq!(n.id, "img/1"),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
