//! Connection heartbeats and the stale-connection sweep
//!
//! Each connection gets a fixed-interval ping task; a registry-wide sweep at
//! the same interval reaps connections whose `last_seen` has fallen behind,
//! independent of explicit disconnect handling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sy_core::time::{current_time_millis, elapsed_millis};
use sy_protocol::OrchestratorMessage;

use crate::session::{self, AgentConnection};
use crate::state::OrchestratorState;

/// Start the fixed-interval ping task for a connection.
pub fn spawn_heartbeat(connection: Arc<AgentConnection>, interval: Duration) {
    let conn = Arc::clone(&connection);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately; the agent just connected
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = conn.cancel_token().cancelled() => break,
                _ = ticker.tick() => {
                    let ping = OrchestratorMessage::Ping {
                        timestamp: current_time_millis(),
                    };
                    if conn.send(ping).await.is_err() {
                        tracing::debug!(
                            server_id = %conn.server_id,
                            "Heartbeat stopping, outbound queue closed"
                        );
                        break;
                    }
                }
            }
        }
    });
    connection.set_heartbeat(handle);
}

/// Run the stale-connection sweep until cancelled.
///
/// Any connection whose `last_seen` exceeds `heartbeat_interval *
/// stale_multiple` is disconnected through the normal teardown path, which
/// fails its pending commands and marks the server offline.
pub async fn run_stale_sweep(state: Arc<OrchestratorState>, cancel: CancellationToken) {
    let interval = state.config.heartbeat_interval;
    let stale_after = state.config.stale_after().as_millis() as u64;
    let mut ticker = tokio::time::interval(interval);

    tracing::info!(
        interval_secs = interval.as_secs(),
        stale_after_ms = stale_after,
        "Starting stale-connection sweep"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stale-connection sweep shutting down");
                break;
            }
            _ = ticker.tick() => {
                for conn in state.registry.list() {
                    let idle = elapsed_millis(conn.last_seen());
                    if idle > stale_after {
                        tracing::warn!(
                            server_id = %conn.server_id,
                            idle_ms = idle,
                            last_latency_ms = conn.latency_ms(),
                            "Reaping stale agent connection"
                        );
                        session::disconnect_agent(
                            &state,
                            &conn.server_id,
                            conn.generation,
                            "heartbeat timed out",
                        )
                        .await;
                    }
                }
            }
        }
    }
}
