//! Live connections indexed by client id.
//!
//! Two maps, `client id → connection` and `connection → client id`, kept
//! under one lock so no reader ever sees half of an update. The registry is
//! owned by a server and handed to whoever needs to address a client; there
//! is no global instance.
//!
//! Removal is keyed by [`ConnectionId`], so a late cleanup for a connection
//! that was already replaced under the same client id is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;

use crate::client_id::ClientId;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{Result, WireError};
use crate::protocol::Message;

/// What `add` does when the client id is already registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the existing connection and fail the new registration.
    #[default]
    Reject,
    /// Register the new connection and close the displaced one.
    Replace,
}

/// Outcome of a best-effort broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Connections whose writer accepted the message.
    pub delivered: usize,
    /// Clients the message could not be queued for.
    pub failed: Vec<ClientId>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ClientId, ConnectionHandle>,
    by_conn: HashMap<ConnectionId, ClientId>,
}

/// Concurrent bidirectional index of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    policy: DuplicatePolicy,
}

impl ConnectionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `connection` under `client_id`.
    ///
    /// # Errors
    ///
    /// `DuplicateClient` if the id is taken and the policy is `Reject`, or if
    /// this connection is already registered.
    pub fn add(&self, client_id: ClientId, connection: ConnectionHandle) -> Result<()> {
        let displaced = {
            let mut inner = self.write();

            if let Some(existing) = inner.by_conn.get(&connection.id()) {
                return Err(WireError::DuplicateClient(existing.clone()));
            }

            let displaced = match inner.by_id.get(&client_id) {
                None => None,
                Some(_) if self.policy == DuplicatePolicy::Reject => {
                    return Err(WireError::DuplicateClient(client_id));
                }
                Some(old) => {
                    let old = old.clone();
                    inner.by_conn.remove(&old.id());
                    Some(old)
                }
            };

            inner.by_conn.insert(connection.id(), client_id.clone());
            inner.by_id.insert(client_id.clone(), connection);
            displaced
        };

        if let Some(old) = displaced {
            tracing::warn!(client_id = %client_id, "replaced existing connection");
            old.close();
        }
        Ok(())
    }

    /// Register and return a guard that removes the entry when dropped.
    pub fn register(
        self: &Arc<Self>,
        client_id: ClientId,
        connection: ConnectionHandle,
    ) -> Result<Registration> {
        let connection_id = connection.id();
        self.add(client_id, connection)?;
        Ok(Registration {
            registry: Arc::clone(self),
            connection_id,
        })
    }

    /// Remove a connection. Idempotent; returns its client id if it was
    /// still registered.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<ClientId> {
        let mut inner = self.write();
        let client_id = inner.by_conn.remove(&connection_id)?;
        inner.by_id.remove(&client_id);
        Some(client_id)
    }

    /// Remove by client id. Does not close the connection.
    pub fn remove_client(&self, client_id: &ClientId) -> Option<ConnectionHandle> {
        let mut inner = self.write();
        let connection = inner.by_id.remove(client_id)?;
        inner.by_conn.remove(&connection.id());
        Some(connection)
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<ConnectionHandle> {
        self.read().by_id.get(client_id).cloned()
    }

    pub fn client_id_of(&self, connection_id: ConnectionId) -> Option<ClientId> {
        self.read().by_conn.get(&connection_id).cloned()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.read().by_id.contains_key(client_id)
    }

    /// Registered client ids, sorted.
    pub fn list_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Point-in-time copy of all entries.
    pub fn snapshot(&self) -> Vec<(ClientId, ConnectionHandle)> {
        self.read()
            .by_id
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect()
    }

    /// Queue `message` for one client.
    ///
    /// # Errors
    ///
    /// `UnknownClient` if nothing is registered under `client_id`; otherwise
    /// whatever the connection's send failed with.
    pub async fn send_to(&self, client_id: &ClientId, message: Message) -> Result<()> {
        let connection = self
            .lookup(client_id)
            .ok_or_else(|| WireError::UnknownClient(client_id.clone()))?;
        connection.send(message).await
    }

    /// Best-effort send to every registered connection.
    ///
    /// A failure on one connection does not stop the others.
    pub async fn broadcast(&self, message: Message) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        for (client_id, connection) in self.snapshot() {
            match connection.send(message.clone()).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, "broadcast send failed: {}", e);
                    summary.failed.push(client_id);
                }
            }
        }
        summary
    }

    /// Close every registered connection. Entries are removed as their
    /// drivers finish.
    pub fn close_all(&self) -> usize {
        let connections = self.snapshot();
        for (_, connection) in &connections {
            connection.close();
        }
        connections.len()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.read();
        inner.by_id.len() == inner.by_conn.len()
            && inner
                .by_id
                .iter()
                .all(|(id, conn)| inner.by_conn.get(&conn.id()) == Some(id))
    }
}

/// Removes its registry entry when dropped.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    connection_id: ConnectionId,
}

impl Registration {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::protocol::{FrameBuffer, MessageType};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn connection() -> (ConnectionHandle, DuplexStream) {
        let (local, peer) = duplex(4096);
        let (handle, driver) = Connection::establish(local, None, &ConnectionConfig::default());
        drop(driver);
        (handle, peer)
    }

    fn id(n: u32) -> ClientId {
        ClientId::from(format!("client-{:012x}", n))
    }

    #[tokio::test]
    async fn test_add_lookup_remove() {
        let registry = ConnectionRegistry::default();
        let (conn, _peer) = connection();

        registry.add(id(1), conn.clone()).unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup(&id(1)), Some(conn.clone()));
        assert_eq!(registry.client_id_of(conn.id()), Some(id(1)));

        assert_eq!(registry.remove(conn.id()), Some(id(1)));
        assert_eq!(registry.remove(conn.id()), None);
        assert!(registry.lookup(&id(1)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_rejected_by_default() {
        let registry = ConnectionRegistry::default();
        let (first, _p1) = connection();
        let (second, _p2) = connection();

        registry.add(id(1), first.clone()).unwrap();
        let err = registry.add(id(1), second).unwrap_err();

        assert!(matches!(err, WireError::DuplicateClient(_)));
        assert_eq!(registry.lookup(&id(1)), Some(first));
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_same_connection_twice_rejected() {
        let registry = ConnectionRegistry::default();
        let (conn, _peer) = connection();

        registry.add(id(1), conn.clone()).unwrap();
        assert!(registry.add(id(2), conn).is_err());
        assert_eq!(registry.list_ids(), vec![id(1)]);
    }

    #[tokio::test]
    async fn test_replace_closes_displaced() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Replace);
        let (first, _p1) = connection();
        let (second, _p2) = connection();

        registry.add(id(1), first.clone()).unwrap();
        registry.add(id(1), second.clone()).unwrap();

        assert!(first.is_closed());
        assert_eq!(registry.lookup(&id(1)), Some(second.clone()));
        assert!(registry.is_consistent());

        // Late cleanup of the displaced connection leaves the new entry alone
        assert_eq!(registry.remove(first.id()), None);
        assert_eq!(registry.lookup(&id(1)), Some(second));
    }

    #[tokio::test]
    async fn test_registration_guard_removes_once() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (conn, _peer) = connection();

        let guard = registry.register(id(7), conn.clone()).unwrap();
        assert_eq!(guard.connection_id(), conn.id());
        assert!(registry.contains(&id(7)));

        // Explicit removal racing with the guard
        registry.remove(conn.id());
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let registry = ConnectionRegistry::default();
        let err = registry
            .send_to(&id(9), Message::business_request("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn test_send_to_closed_connection_is_send_failure() {
        let registry = ConnectionRegistry::default();
        let (conn, _peer) = connection();
        registry.add(id(1), conn.clone()).unwrap();
        conn.close();

        let err = registry
            .send_to(&id(1), Message::business_request("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failures() {
        let registry = ConnectionRegistry::default();
        let (alive, mut alive_peer) = connection();
        let (dead, _dead_peer) = connection();
        registry.add(id(1), alive).unwrap();
        registry.add(id(2), dead.clone()).unwrap();
        dead.close();

        let summary = registry
            .broadcast(Message::new(MessageType::BusinessResponse, "all"))
            .await;

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, vec![id(2)]);

        let mut buf = [0u8; 8];
        alive_peer.read_exact(&mut buf).await.unwrap();
        let messages = FrameBuffer::new().push(&buf).unwrap();
        assert_eq!(messages[0].payload(), b"all");
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::default();
        let conns: Vec<_> = (0..3).map(|_| connection()).collect();
        for (i, (conn, _)) in conns.iter().enumerate() {
            registry.add(id(i as u32), conn.clone()).unwrap();
        }

        assert_eq!(registry.close_all(), 3);
        assert!(conns.iter().all(|(conn, _)| conn.is_closed()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove_consistency() {
        let registry = Arc::new(ConnectionRegistry::new(DuplicatePolicy::Replace));
        let mut tasks = Vec::new();

        for worker in 0..8u32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut peers = Vec::new();
                for i in 0..50u32 {
                    let (conn, peer) = connection();
                    peers.push(peer);
                    // Overlapping ids across workers exercise Replace
                    let client = id(i % 20);
                    registry.add(client, conn.clone()).unwrap();
                    if (i + worker) % 3 == 0 {
                        registry.remove(conn.id());
                    }
                    tokio::task::yield_now().await;
                }
                peers
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(registry.is_consistent());
        assert!(registry.count() <= 20);
        for client in registry.list_ids() {
            let conn = registry.lookup(&client).unwrap();
            assert_eq!(registry.client_id_of(conn.id()), Some(client));
        }
    }
}
