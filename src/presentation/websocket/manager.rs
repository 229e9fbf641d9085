//! Connection Manager
//!
//! Owns every live connection and the user -> connections index used to
//! fan frames out to all of a user's devices.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{CloseReason, Connection, ConnectionError, ConnectionState};
use super::messages::WireMessage;
use crate::config::WebSocketSettings;
use crate::infrastructure::metrics;
use crate::presentation::middleware::auth::AuthUser;

/// Outcome of a fan-out to one user's connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ConnectionManager {
    /// Live connections by connection id
    connections: DashMap<String, Arc<Connection>>,
    /// User id to that user's connection ids
    by_user: DashMap<String, HashSet<String>>,
    max_per_user: usize,
    outbound_buffer: usize,
    /// Parent of every connection token
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(max_per_user: usize, outbound_buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            max_per_user: max_per_user.max(1),
            outbound_buffer,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_settings(settings: &WebSocketSettings) -> Self {
        Self::new(settings.max_connections_per_user, settings.outbound_buffer)
    }

    /// Build a connection for a verified user. It is not routable until
    /// [`register`](Self::register) succeeds.
    pub fn new_connection(&self, user: AuthUser) -> (Arc<Connection>, mpsc::Receiver<Utf8Bytes>) {
        let id = format!("{}-{}", user.user_id, Uuid::new_v4().simple());
        Connection::new(id, user, self.outbound_buffer, self.shutdown.child_token())
    }

    /// Add a connection to the index and mark it active.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        {
            // The entry guard serializes registrations of the same user
            let mut ids = self.by_user.entry(connection.user_id().to_string()).or_default();
            if ids.len() >= self.max_per_user {
                tracing::warn!(
                    user_id = %connection.user_id(),
                    limit = self.max_per_user,
                    "Connection limit reached"
                );
                return Err(ConnectionError::LimitExceeded {
                    limit: self.max_per_user,
                });
            }
            ids.insert(connection.id().to_string());
            self.connections
                .insert(connection.id().to_string(), connection.clone());
        }

        connection.transition(ConnectionState::Active);
        metrics::set_websocket_connections(self.count());

        tracing::info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a connection from every index. Unknown ids are ignored.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(connection_id)?;
        let user_id = connection.user_id();

        if let Some(mut ids) = self.by_user.get_mut(user_id) {
            ids.remove(connection_id);
        }
        self.by_user.remove_if(user_id, |_, ids| ids.is_empty());

        metrics::set_websocket_connections(self.count());
        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            "Connection unregistered"
        );
        Some(connection)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = match self.by_user.get(user_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Send to every live connection of `user_id`. A failing socket never
    /// stops delivery to its siblings; a socket whose queue is full is
    /// closed rather than silently skipping frames.
    pub fn broadcast_to_user(&self, user_id: &str, message: &WireMessage) -> BroadcastReport {
        let targets = self.connections_for_user(user_id);
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let frame: Utf8Bytes = match message.to_json() {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to encode frame");
                return BroadcastReport {
                    delivered: 0,
                    failed: targets.len(),
                };
            }
        };

        let mut report = BroadcastReport::default();
        for connection in targets {
            match connection.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    self.handle_send_error(&connection, &e);
                }
            }
        }
        report
    }

    fn handle_send_error(&self, connection: &Connection, error: &ConnectionError) {
        match error {
            ConnectionError::Backpressure => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    "Outbound queue full, closing slow connection"
                );
                connection.begin_close(CloseReason::SlowConsumer);
            }
            other => {
                tracing::debug!(
                    connection_id = %connection.id(),
                    error = %other,
                    "Dropped frame for closing connection"
                );
            }
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every connection concurrently and wait until all are closed or
    /// `deadline` passes. Close is initiated on every socket either way.
    pub async fn shutdown_with_deadline(&self, deadline: Duration) -> Result<(), ConnectionError> {
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();

        tracing::info!(connections = connections.len(), "Closing all connections");

        for connection in &connections {
            connection.begin_close(CloseReason::GoingAway);
        }
        // Refuses registrations that race with shutdown
        self.shutdown.cancel();

        let all_closed = join_all(connections.iter().map(|c| c.wait_closed()));
        if tokio::time::timeout(deadline, all_closed).await.is_ok() {
            tracing::info!("All connections closed");
            return Ok(());
        }

        let remaining: Vec<String> = connections
            .iter()
            .filter(|c| c.state() != ConnectionState::Closed)
            .map(|c| c.id().to_string())
            .collect();

        if remaining.is_empty() {
            return Ok(());
        }

        tracing::warn!(remaining = remaining.len(), "Shutdown deadline exceeded");
        Err(ConnectionError::DeadlineExceeded { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(id: &str) -> AuthUser {
        AuthUser {
            user_id: id.into(),
            name: id.into(),
            roles: vec!["user".into()],
        }
    }

    fn open(manager: &ConnectionManager, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Utf8Bytes>) {
        let (conn, rx) = manager.new_connection(user(user_id));
        manager.register(conn.clone()).unwrap();
        (conn, rx)
    }

    #[test]
    fn test_connection_id_format() {
        let manager = ConnectionManager::new(10, 8);
        let (conn, _rx) = manager.new_connection(user("u1"));

        assert!(conn.id().starts_with("u1-"));
        assert_eq!(conn.id().len(), "u1-".len() + 32);
    }

    #[test]
    fn test_register_activates_and_indexes() {
        let manager = ConnectionManager::new(10, 8);
        let (a, _ra) = open(&manager, "u1");
        let (_b, _rb) = open(&manager, "u1");

        assert_eq!(a.state(), ConnectionState::Active);
        assert_eq!(manager.count(), 2);
        assert_eq!(manager.user_count(), 1);
        assert_eq!(manager.connections_for_user("u1").len(), 2);
    }

    #[test]
    fn test_per_user_limit() {
        let manager = ConnectionManager::new(2, 8);
        let _a = open(&manager, "u1");
        let _b = open(&manager, "u1");
        let (c, _rc) = manager.new_connection(user("u1"));

        assert_eq!(
            manager.register(c),
            Err(ConnectionError::LimitExceeded { limit: 2 })
        );
        let _other = open(&manager, "u2");
        assert_eq!(manager.count(), 3);
    }

    #[test]
    fn test_unregister_leaves_siblings() {
        let manager = ConnectionManager::new(10, 8);
        let (a, _ra) = open(&manager, "u1");
        let (b, _rb) = open(&manager, "u1");

        assert!(manager.unregister(a.id()).is_some());
        assert!(manager.unregister(a.id()).is_none());

        let remaining = manager.connections_for_user("u1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), b.id());

        manager.unregister(b.id());
        assert!(manager.connections_for_user("u1").is_empty());
        assert_eq!(manager.user_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_device() {
        let manager = ConnectionManager::new(10, 8);
        let (_a, mut ra) = open(&manager, "u1");
        let (_b, mut rb) = open(&manager, "u1");
        let (_c, mut rc) = open(&manager, "u2");

        let report = manager.broadcast_to_user("u1", &WireMessage::loading("s1"));

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });
        assert!(ra.try_recv().unwrap().as_str().contains("\"loading\""));
        assert!(rb.try_recv().is_ok());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_isolates_failed_socket() {
        let manager = ConnectionManager::new(10, 1);
        let (slow, _slow_rx) = open(&manager, "u1");
        let (_fast, mut fast_rx) = open(&manager, "u1");

        // Fill the slow connection's queue
        slow.send("pending".into()).unwrap();

        let report = manager.broadcast_to_user("u1", &WireMessage::loading("s1"));

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_close() {
        let manager = Arc::new(ConnectionManager::new(10, 8));
        let (a, _ra) = open(&manager, "u1");
        let (b, _rb) = open(&manager, "u2");

        // Stand-in for the socket tasks: close once told to
        for conn in [a.clone(), b.clone()] {
            let manager = manager.clone();
            tokio::spawn(async move {
                conn.cancellation().cancelled().await;
                manager.unregister(conn.id());
                conn.mark_closed();
            });
        }

        manager
            .shutdown_with_deadline(Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(a.close_reason(), Some(CloseReason::GoingAway));
        assert_eq!(manager.count(), 0);

        let (late, _rl) = manager.new_connection(user("u3"));
        assert_eq!(manager.register(late), Err(ConnectionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_stragglers() {
        let manager = ConnectionManager::new(10, 8);
        let (stuck, _rx) = open(&manager, "u1");

        let result = manager.shutdown_with_deadline(Duration::from_millis(500)).await;

        assert_eq!(
            result,
            Err(ConnectionError::DeadlineExceeded {
                remaining: vec![stuck.id().to_string()]
            })
        );
        // Close was still initiated
        assert_eq!(stuck.state(), ConnectionState::Closing);
    }
}
