//! Browser socket handling
//!
//! An authenticated browser joins the broadcast room and additionally gets
//! a direct channel for events addressed to it alone (log lines for its
//! subscriptions, subscription errors). The writer merges both; the read
//! loop only handles log subscription management.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use uuid::Uuid;

use sy_core::types::DeploymentId;
use sy_protocol::{codec, BrowserMessage, ServerEvent};

use crate::state::OrchestratorState;

/// Per-connection buffer for directly addressed events. Slow browsers lose
/// log lines rather than backing up the agent stream.
const DIRECT_BUFFER: usize = 64;

pub async fn run(state: Arc<OrchestratorState>, socket: WebSocket, user_id: String) {
    let client_id = Uuid::new_v4().to_string();
    tracing::info!(client_id = %client_id, user_id = %user_id, "Browser connected");

    let mut room_rx = state.broadcaster.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::channel::<ServerEvent>(DIRECT_BUFFER);
    let (mut sink, mut stream) = socket.split();

    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = room_rx.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(client_id = %writer_client, missed, "Browser lagging behind the room");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                event = direct_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let text = match codec::encode(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode browser event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode::<BrowserMessage>(&text) {
                Ok(message) => handle_message(&state, &client_id, &direct_tx, message).await,
                Err(e) => {
                    tracing::debug!(client_id = %client_id, error = %e, "Undecodable browser frame, ignoring");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "Browser socket error");
                break;
            }
        }
    }

    // Leaving drops every subscription; the last subscriber leaving a
    // stream closes it agent-side.
    state.logs.unsubscribe(&client_id, None).await;
    writer.abort();
    tracing::info!(client_id = %client_id, "Browser disconnected");
}

async fn handle_message(
    state: &Arc<OrchestratorState>,
    client_id: &str,
    direct_tx: &mpsc::Sender<ServerEvent>,
    message: BrowserMessage,
) {
    match message {
        BrowserMessage::SubscribeLogs { deployment_id } => {
            let deployment_id = DeploymentId::new(deployment_id);
            if let Err(e) = state
                .logs
                .subscribe(client_id, &deployment_id, direct_tx.clone())
                .await
            {
                tracing::debug!(client_id, deployment_id = %deployment_id, error = %e, "Log subscription refused");
                let _ = direct_tx.try_send(ServerEvent::LogError {
                    deployment_id: deployment_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
        BrowserMessage::UnsubscribeLogs { stream_id } => {
            state.logs.unsubscribe(client_id, stream_id.as_deref()).await;
        }
    }
}
