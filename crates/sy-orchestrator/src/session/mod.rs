//! Agent session management
//!
//! One live connection per server id, newest wins. Successive connections
//! are tagged with a per-server generation so continuations that outlive a
//! reconnect can detect that their payloads are stale.

mod generation;
mod heartbeat;
mod registry;

pub use generation::GenerationRegistry;
pub use heartbeat::{run_stale_sweep, spawn_heartbeat};
pub use registry::{AgentConnection, AgentRegistry};

use std::sync::Arc;

use tokio::sync::mpsc;

use sy_core::time::current_time_millis;
use sy_core::types::{AgentHealth, ServerId};
use sy_protocol::{OrchestratorMessage, ServerEvent};

use crate::state::OrchestratorState;
use crate::sync::server_key;

/// A freshly registered agent connection plus the receiver its socket
/// writer task drains.
pub struct Registration {
    pub connection: Arc<AgentConnection>,
    pub outbound_rx: mpsc::Receiver<OrchestratorMessage>,
}

/// Register an authenticated agent connection under the server mutex.
///
/// Force-closes any prior connection for the server id (its heartbeat is
/// cancelled and its socket task unwinds), allocates the next generation,
/// starts the heartbeat, and marks the server online.
pub async fn register_agent(state: &Arc<OrchestratorState>, server_id: &ServerId) -> Registration {
    let registration = state
        .locks
        .run(&server_key(server_id), async {
            if let Some(old) = state.registry.remove(server_id) {
                tracing::info!(
                    server_id = %server_id,
                    old_generation = old.generation,
                    "Replacing previous agent connection"
                );
                old.close();
            }

            let generation = state.generations.next(server_id);
            let (outbound_tx, outbound_rx) = mpsc::channel(256);
            let connection = Arc::new(AgentConnection::new(
                server_id.clone(),
                generation,
                outbound_tx,
            ));
            state.registry.insert(Arc::clone(&connection));
            spawn_heartbeat(Arc::clone(&connection), state.config.heartbeat_interval);

            if let Err(e) = state
                .servers
                .set_health(server_id, AgentHealth::Connected, current_time_millis())
                .await
            {
                tracing::warn!(server_id = %server_id, error = %e, "Failed to mark server online");
            }

            Registration {
                connection,
                outbound_rx,
            }
        })
        .await;

    state.broadcaster.send(ServerEvent::ServerConnected {
        server_id: server_id.to_string(),
    });

    registration
}

/// Tear down an agent connection, explicit disconnect and reaper both.
///
/// A no-op when the connection of `generation` has already been replaced:
/// the replacement owns the server id now and must not be torn down by the
/// old socket's unwinding.
pub async fn disconnect_agent(
    state: &Arc<OrchestratorState>,
    server_id: &ServerId,
    generation: u64,
    reason: &str,
) {
    let Some(connection) = state.registry.remove_if_generation(server_id, generation) else {
        tracing::debug!(
            server_id = %server_id,
            generation,
            "Skipping teardown for superseded connection"
        );
        return;
    };
    connection.close();

    tracing::info!(server_id = %server_id, generation, reason, "Agent disconnected");

    // Every in-flight command and log request for this server fails now,
    // through the same deployment-error path as a timeout.
    state.dispatcher.cleanup_for_server(server_id).await;
    state.logs.cleanup_for_server(server_id).await;
    state.generations.cleanup_if_current(server_id, generation);

    if let Err(e) = state
        .servers
        .set_health(server_id, AgentHealth::Disconnected, current_time_millis())
        .await
    {
        tracing::warn!(server_id = %server_id, error = %e, "Failed to mark server offline");
    }

    state.broadcaster.send(ServerEvent::ServerDisconnected {
        server_id: server_id.to_string(),
    });
}
