use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use sy_core::error::AuthError;
use sy_core::time::current_time_millis;
use sy_core::types::{AgentHealth, ServerId};

use crate::server::{agent, browser};
use crate::state::OrchestratorState;

/// Build the orchestrator's router: the shared WebSocket endpoint plus a
/// plain health check.
pub fn router(state: Arc<OrchestratorState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(state: Arc<OrchestratorState>) -> anyhow::Result<()> {
    let bind_address = state.config.bind_address.clone();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(%bind_address, "Listening for agent and browser connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(state): State<Arc<OrchestratorState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // An agent claims a server id up front; its credentials are checked
    // before the upgrade completes so a bad token costs one HTTP round trip.
    if let Some(claimed) = header_str(&headers, "x-server-id") {
        let server_id = ServerId::new(claimed);
        let bearer = header_str(&headers, header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        match authorize_agent(&state, &server_id, peer.ip(), bearer.as_deref()).await {
            Ok(()) => ws.on_upgrade(move |socket| agent::run(state, socket, server_id)),
            Err(e) => {
                tracing::warn!(server_id = %server_id, peer = %peer, error = %e, "Agent authentication failed");
                StatusCode::UNAUTHORIZED.into_response()
            }
        }
    } else {
        let Some(cookie) = header_str(&headers, header::COOKIE.as_str()).map(str::to_string) else {
            return StatusCode::UNAUTHORIZED.into_response();
        };
        match state.browser_auth.validate(&cookie).await {
            Some(user_id) => ws.on_upgrade(move |socket| browser::run(state, socket, user_id)),
            None => {
                tracing::debug!(peer = %peer, "Browser session cookie rejected");
                StatusCode::UNAUTHORIZED.into_response()
            }
        }
    }
}

/// Run a claimed agent identity through its credential checks, walking the
/// server row's health alongside: `authenticating` while checks run, back to
/// `disconnected` on rejection. Registration sets `connected` after the
/// upgrade completes.
async fn authorize_agent(
    state: &Arc<OrchestratorState>,
    server_id: &ServerId,
    peer: IpAddr,
    bearer: Option<&str>,
) -> Result<(), AuthError> {
    // unknown server ids have no row to mark; the authenticator rejects them
    let _ = state
        .servers
        .set_health(server_id, AgentHealth::Authenticating, current_time_millis())
        .await;

    match state.authenticator.authenticate(server_id, peer, bearer).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Err(store_err) = state
                .servers
                .set_health(server_id, AgentHealth::Disconnected, current_time_millis())
                .await
            {
                tracing::debug!(server_id = %server_id, error = %store_err, "Could not reset health after rejection");
            }
            Err(e)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
