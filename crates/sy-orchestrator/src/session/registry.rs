//! Agent session registry
//!
//! One live connection per server id. Insertion always replaces; removal is
//! generation-checked so a replaced connection's unwinding cannot tear down
//! its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sy_core::time::current_time_millis;
use sy_core::types::ServerId;
use sy_protocol::OrchestratorMessage;

/// A live, authenticated connection to one server's agent.
pub struct AgentConnection {
    /// Server this connection belongs to
    pub server_id: ServerId,
    /// Generation tag allocated when this connection was accepted
    pub generation: u64,
    /// Outbound message queue, drained by the socket writer task
    outbound: mpsc::Sender<OrchestratorMessage>,
    /// Millis since epoch of the last message received on this connection
    last_seen: AtomicU64,
    /// Last measured heartbeat round-trip, millis
    latency_ms: AtomicU64,
    /// Cancels the socket tasks when the connection is closed or replaced
    cancel: CancellationToken,
    /// Heartbeat ping task handle
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl AgentConnection {
    /// Create a connection handle around an outbound queue.
    pub fn new(
        server_id: ServerId,
        generation: u64,
        outbound: mpsc::Sender<OrchestratorMessage>,
    ) -> Self {
        Self {
            server_id,
            generation,
            outbound,
            last_seen: AtomicU64::new(current_time_millis()),
            latency_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            heartbeat: StdMutex::new(None),
        }
    }

    /// Queue a message for the agent.
    pub async fn send(
        &self,
        message: OrchestratorMessage,
    ) -> Result<(), SendError<OrchestratorMessage>> {
        self.outbound.send(message).await
    }

    /// Queue a message without waiting; used on best-effort paths.
    pub fn try_send(
        &self,
        message: OrchestratorMessage,
    ) -> Result<(), TrySendError<OrchestratorMessage>> {
        self.outbound.try_send(message)
    }

    /// Record activity on this connection.
    pub fn touch(&self) {
        self.last_seen
            .store(current_time_millis(), Ordering::Relaxed);
    }

    /// Millis since epoch of the last received message.
    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Record a heartbeat round-trip measurement.
    pub fn record_latency(&self, millis: u64) {
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// Last measured heartbeat round-trip, millis.
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Token the socket tasks select on.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Store the heartbeat task handle.
    pub(crate) fn set_heartbeat(&self, handle: JoinHandle<()>) {
        let mut slot = self.heartbeat.lock().expect("heartbeat slot poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Close the connection: cancel the socket tasks and the heartbeat.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self
            .heartbeat
            .lock()
            .expect("heartbeat slot poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

/// Registry of live agent connections indexed by server id.
pub struct AgentRegistry {
    connections: DashMap<ServerId, Arc<AgentConnection>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection, returning the one it replaced, if any.
    pub fn insert(&self, connection: Arc<AgentConnection>) -> Option<Arc<AgentConnection>> {
        self.connections
            .insert(connection.server_id.clone(), connection)
    }

    /// Get the live connection for a server.
    pub fn get(&self, server_id: &ServerId) -> Option<Arc<AgentConnection>> {
        self.connections.get(server_id).map(|r| Arc::clone(&r))
    }

    /// Remove whatever connection a server currently has.
    pub fn remove(&self, server_id: &ServerId) -> Option<Arc<AgentConnection>> {
        self.connections.remove(server_id).map(|(_, conn)| conn)
    }

    /// Remove the server's connection only if it still carries `generation`.
    pub fn remove_if_generation(
        &self,
        server_id: &ServerId,
        generation: u64,
    ) -> Option<Arc<AgentConnection>> {
        self.connections
            .remove_if(server_id, |_, conn| conn.generation == generation)
            .map(|(_, conn)| conn)
    }

    /// List all live connections.
    pub fn list(&self) -> Vec<Arc<AgentConnection>> {
        self.connections.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(id: &str, generation: u64) -> (Arc<AgentConnection>, mpsc::Receiver<OrchestratorMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Arc::new(AgentConnection::new(ServerId::new(id), generation, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_insert_replaces_previous() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = test_connection("srv-1", 1);
        let (second, _rx2) = test_connection("srv-1", 2);

        assert!(registry.insert(first).is_none());
        let replaced = registry.insert(Arc::clone(&second)).unwrap();
        assert_eq!(replaced.generation, 1);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&ServerId::new("srv-1")).unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_remove_if_generation_protects_replacement() {
        let registry = AgentRegistry::new();
        let server = ServerId::new("srv-1");
        let (second, _rx) = test_connection("srv-1", 2);
        registry.insert(second);

        // Old connection's teardown must not remove the replacement.
        assert!(registry.remove_if_generation(&server, 1).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_if_generation(&server, 2).is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_after_receiver_drop_fails() {
        let (conn, rx) = test_connection("srv-1", 1);
        drop(rx);
        assert!(conn
            .send(OrchestratorMessage::StatusRequest)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_latency_recording_round_trip() {
        let (conn, _rx) = test_connection("srv-1", 1);
        assert_eq!(conn.latency_ms(), 0);
        conn.record_latency(42);
        assert_eq!(conn.latency_ms(), 42);
    }

    #[tokio::test]
    async fn test_close_cancels_token() {
        let (conn, _rx) = test_connection("srv-1", 1);
        assert!(!conn.cancel_token().is_cancelled());
        conn.close();
        assert!(conn.cancel_token().is_cancelled());
    }
}
