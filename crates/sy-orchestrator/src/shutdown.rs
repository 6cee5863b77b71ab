//! Bounded shutdown drain
//!
//! Shutdown announces itself to every agent and browser, waits a bounded
//! time for in-flight commands to finish, then force-aborts whatever is
//! left and closes all connections. The budget means a hung agent can delay
//! shutdown but never prevent it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use sy_protocol::{OrchestratorMessage, ServerEvent};

use crate::state::OrchestratorState;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Drain and stop the orchestrator.
pub async fn run(state: &Arc<OrchestratorState>) {
    tracing::info!(
        pending_commands = state.dispatcher.pending_count(),
        agents = state.registry.len(),
        "Shutdown starting"
    );

    // Stops the listener, the stale sweep, and the proxy reload worker.
    state.shutdown.cancel();

    for connection in state.registry.list() {
        // best effort; a full queue or closed socket changes nothing
        let _ = connection.try_send(OrchestratorMessage::Shutdown);
    }
    state.broadcaster.send(ServerEvent::ServerShutdown);

    let deadline = Instant::now() + state.config.drain_budget;
    while state.dispatcher.pending_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(DRAIN_POLL).await;
    }

    let leftover = state.dispatcher.pending_count();
    if leftover > 0 {
        tracing::warn!(leftover, "Drain budget exhausted, aborting remaining commands");
    }
    state.dispatcher.abort_all().await;

    for connection in state.registry.list() {
        connection.close();
        state.registry.remove(&connection.server_id);
    }

    tracing::info!("Shutdown complete");
}
