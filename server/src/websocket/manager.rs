//! WebSocket connection manager.
//!
//! Tracks active push sockets and fans new updates out to them.

use std::sync::Arc;

use cardsync_engine::{PushFrame, Update, UserId};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for outbound frames.
pub type FrameSender = mpsc::UnboundedSender<PushFrame>;

/// A single push socket.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// User the socket belongs to
    pub user_id: UserId,
    /// Channel to send frames to this connection
    pub sender: FrameSender,
}

/// Manages active push sockets.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs per user.
    by_user: DashMap<UserId, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, user_id: UserId, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                user_id: user_id.clone(),
                sender,
            },
        );
        self.by_user.entry(user_id).or_default().push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "Push connection registered");
        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_user.get_mut(&conn.user_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_user.remove(&conn.user_id);
                }
            }

            tracing::info!(conn_id = %conn_id, user_id = %conn.user_id, "Push connection unregistered");
        }
    }

    /// Send an update frame to every connection, the author's included;
    /// clients recognise their own echoes by mutation ID.
    ///
    /// Returns the number of connections that received it.
    pub fn broadcast(&self, update: &Update) -> usize {
        let frame = PushFrame::Update {
            update: update.clone(),
        };

        let sent_count = self
            .connections
            .iter()
            .filter(|entry| entry.value().sender.send(frame.clone()).is_ok())
            .count();

        tracing::debug!(
            update_id = %update.id,
            recipients = sent_count,
            "Broadcast update to push connections"
        );
        sent_count
    }

    /// Send a frame to a specific connection.
    pub fn send_to(&self, conn_id: &str, frame: PushFrame) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct users connected.
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_engine::{payload, ChangeKind};
    use serde_json::json;

    fn update() -> Update {
        Update::new(
            "u-1",
            "c1",
            ChangeKind::Moved,
            payload(json!({"column": "done"})),
            "alice",
            1,
        )
    }

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let conn1 = manager.register("alice".to_string(), tx1);
        let conn2 = manager.register("alice".to_string(), tx2);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.user_count(), 1);

        manager.unregister(&conn1);
        assert_eq!(manager.user_count(), 1);
        manager.unregister(&conn2);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.user_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("alice".to_string(), tx1);
        manager.register("bob".to_string(), tx2);

        assert_eq!(manager.broadcast(&update()), 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                PushFrame::Update { update } => assert_eq!(update.id, "u-1"),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[test]
    fn test_closed_receivers_are_skipped() {
        let manager = ConnectionManager::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.register("alice".to_string(), tx1);
        let bob = manager.register("bob".to_string(), tx2);
        drop(rx1);

        assert_eq!(manager.broadcast(&update()), 1);
        assert!(manager.send_to(&bob, PushFrame::Ping));
        assert!(!manager.send_to("missing", PushFrame::Ping));
    }
}
