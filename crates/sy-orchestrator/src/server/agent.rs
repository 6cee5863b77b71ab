//! Agent socket handling
//!
//! Each agent connection runs a writer task draining its outbound queue and
//! a read loop feeding the engines. The read loop checks the connection's
//! generation before trusting any frame: a frame arriving after a reconnect
//! replaced this connection belongs to a dead session and ends the loop
//! instead of being processed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use sy_core::time::{current_time_millis, elapsed_millis};
use sy_core::types::{CommandId, ServerId};
use sy_protocol::{codec, AgentMessage, OrchestratorMessage, ProtocolError, PROTOCOL_VERSION};

use crate::session::{self, AgentConnection, Registration};
use crate::state::OrchestratorState;

pub async fn run(state: Arc<OrchestratorState>, socket: WebSocket, server_id: ServerId) {
    let Registration {
        connection,
        mut outbound_rx,
    } = session::register_agent(&state, &server_id).await;
    let generation = connection.generation;

    // Queued before the writer starts, so they are the first frames out.
    let hello = connection
        .send(OrchestratorMessage::AuthOk {
            version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: state.config.heartbeat_interval.as_secs(),
        })
        .await;
    let _ = connection.send(OrchestratorMessage::StatusRequest).await;
    if hello.is_err() {
        session::disconnect_agent(&state, &server_id, generation, "outbound queue closed").await;
        return;
    }

    let (mut sink, mut stream) = socket.split();

    let writer_cancel = connection.cancel_token().clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    let text = match codec::encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode outbound frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let read_cancel = connection.cancel_token().clone();
    let reason = loop {
        tokio::select! {
            _ = read_cancel.cancelled() => break "connection closed",
            frame = stream.next() => {
                match frame {
                    Some(Ok(message)) => match process_frame(&state, &connection, message).await {
                        FrameOutcome::Superseded => break "superseded by newer connection",
                        FrameOutcome::Closed => break "socket closed",
                        FrameOutcome::Processed | FrameOutcome::Ignored => {}
                    },
                    None => break "socket closed",
                    Some(Err(e)) => {
                        tracing::debug!(server_id = %server_id, error = %e, "Agent socket error");
                        break "socket error";
                    }
                }
            }
        }
    };

    session::disconnect_agent(&state, &server_id, generation, reason).await;
    writer.abort();
}

/// What the read loop should do after one frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Processed,
    Ignored,
    /// This connection was replaced; the frame was not trusted
    Superseded,
    Closed,
}

/// Handle one frame from the agent socket.
///
/// A replaced connection stops processing instantly, even if its socket
/// still delivers frames: the generation check runs before anything is
/// decoded or trusted.
async fn process_frame(
    state: &Arc<OrchestratorState>,
    connection: &Arc<AgentConnection>,
    message: Message,
) -> FrameOutcome {
    let server_id = &connection.server_id;
    match message {
        Message::Text(text) => {
            if !state
                .generations
                .is_current(server_id, connection.generation)
            {
                return FrameOutcome::Superseded;
            }
            connection.touch();
            match codec::decode::<AgentMessage>(&text) {
                Ok(message) => {
                    handle_message(state, connection, server_id, message).await;
                    FrameOutcome::Processed
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "Undecodable agent frame, ignoring");
                    FrameOutcome::Ignored
                }
            }
        }
        Message::Binary(data) => {
            tracing::warn!(
                server_id = %server_id,
                error = %ProtocolError::UnexpectedBinary(data.len()),
                "Dropping agent frame"
            );
            FrameOutcome::Ignored
        }
        Message::Close(_) => FrameOutcome::Closed,
        Message::Ping(_) | Message::Pong(_) => FrameOutcome::Ignored,
    }
}

async fn handle_message(
    state: &Arc<OrchestratorState>,
    connection: &Arc<AgentConnection>,
    server_id: &ServerId,
    message: AgentMessage,
) {
    match message {
        AgentMessage::Status(report) => {
            state.reconciler.ingest(server_id, report).await;
        }
        AgentMessage::CommandAck {
            command_id,
            received_at,
        } => {
            state
                .dispatcher
                .handle_ack(server_id, &CommandId::new(command_id), received_at)
                .await;
        }
        AgentMessage::CommandResult {
            command_id,
            status,
            message,
            duration,
            data,
        } => {
            state
                .dispatcher
                .handle_result(
                    server_id,
                    &CommandId::new(command_id),
                    status,
                    message,
                    duration,
                    data,
                )
                .await;
        }
        AgentMessage::LogsResult {
            request_id,
            lines,
            error,
        } => {
            state
                .logs
                .handle_logs_result(server_id, &request_id, lines, error);
        }
        AgentMessage::LogStreamLine { stream_id, line } => {
            state.logs.handle_line(server_id, &stream_id, line);
        }
        AgentMessage::LogStreamStatus {
            stream_id,
            status,
            message,
        } => {
            state
                .logs
                .handle_status(server_id, &stream_id, status, message);
        }
        AgentMessage::Pong { timestamp } => {
            if timestamp <= current_time_millis() {
                connection.record_latency(elapsed_millis(timestamp));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_server, test_state};
    use sy_core::traits::ServerStore;
    use sy_protocol::{MetricsSnapshot, StatusReport};

    fn status_frame() -> String {
        codec::encode(&AgentMessage::Status(StatusReport {
            metrics: Some(MetricsSnapshot {
                cpu_percent: 12.5,
                memory_used: 1024,
                memory_total: 4096,
                disk_used: 10,
                disk_total: 100,
            }),
            network: None,
            apps: vec![],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_superseded_connection_frames_not_processed() {
        let fixture = test_state();
        seed_server(&fixture, "srv-1", false);
        let server_id = ServerId::new("srv-1");

        let first = session::register_agent(&fixture.state, &server_id).await;
        let second = session::register_agent(&fixture.state, &server_id).await;

        // a frame still in flight on the replaced socket is not trusted
        let outcome = process_frame(
            &fixture.state,
            &first.connection,
            Message::Text(status_frame()),
        )
        .await;
        assert_eq!(outcome, FrameOutcome::Superseded);
        let row = fixture.servers.get(&server_id).await.unwrap().unwrap();
        assert!(row.metrics.is_none());

        // the same frame on the current connection lands
        let outcome = process_frame(
            &fixture.state,
            &second.connection,
            Message::Text(status_frame()),
        )
        .await;
        assert_eq!(outcome, FrameOutcome::Processed);
        let row = fixture.servers.get(&server_id).await.unwrap().unwrap();
        assert!(row.metrics.is_some());
    }

    #[tokio::test]
    async fn test_malformed_and_binary_frames_ignored() {
        let fixture = test_state();
        seed_server(&fixture, "srv-1", false);
        let server_id = ServerId::new("srv-1");
        let registration = session::register_agent(&fixture.state, &server_id).await;

        let outcome = process_frame(
            &fixture.state,
            &registration.connection,
            Message::Text("not json".into()),
        )
        .await;
        assert_eq!(outcome, FrameOutcome::Ignored);

        let outcome = process_frame(
            &fixture.state,
            &registration.connection,
            Message::Binary(vec![0, 1, 2]),
        )
        .await;
        assert_eq!(outcome, FrameOutcome::Ignored);

        let outcome = process_frame(&fixture.state, &registration.connection, Message::Close(None)).await;
        assert_eq!(outcome, FrameOutcome::Closed);
    }
}
