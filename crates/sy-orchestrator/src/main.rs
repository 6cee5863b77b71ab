//! Shipyard orchestrator daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use sy_core::config::{default_config_path, load_config, OrchestratorConfig};
use sy_core::error::ConfigError;
use sy_core::traits::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};
use sy_core::types::{AgentHealth, ServerId, ServerRecord};

use sy_orchestrator::auth::HttpBrowserAuth;
use sy_orchestrator::proxy::HttpProxyClient;
use sy_orchestrator::server;
use sy_orchestrator::session::run_stale_sweep;
use sy_orchestrator::shutdown;
use sy_orchestrator::state::OrchestratorState;
use sy_orchestrator::store::{
    MemoryDeploymentStore, MemoryRouteStore, MemoryServerStore, MemoryTokenStore,
};

#[derive(Parser, Debug)]
#[command(name = "sy-orchestrator", version, about = "Fleet deployment orchestrator")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "info", "sy_orchestrator=debug")
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config: OrchestratorConfig = match load_config(&config_path) {
        Ok(config) => {
            tracing::info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(ConfigError::NotFound(path)) => {
            tracing::warn!(path = %path.display(), "No config file, using defaults");
            OrchestratorConfig::default()
        }
        Err(e) => return Err(e).context("failed to load configuration"),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    let servers = Arc::new(MemoryServerStore::new());
    for seed in &config.servers {
        servers.insert(ServerRecord {
            id: ServerId::new(&seed.id),
            is_core: seed.is_core,
            legacy_token_hash: seed.legacy_token_hash.clone(),
            health: AgentHealth::Disconnected,
            last_seen: 0,
            metrics: None,
            network: None,
        });
    }
    tracing::info!(servers = config.servers.len(), "Seeded server registry");

    let shutdown_token = CancellationToken::new();
    let proxy = HttpProxyClient::new(
        config.proxy_admin_url.clone(),
        config.reload_debounce,
        shutdown_token.clone(),
    );
    let browser_auth = Arc::new(HttpBrowserAuth::new(config.auth_endpoint.clone()));

    let state = OrchestratorState::new(
        config,
        servers as Arc<dyn ServerStore>,
        Arc::new(MemoryDeploymentStore::new()) as Arc<dyn DeploymentStore>,
        Arc::new(MemoryRouteStore::new()) as Arc<dyn RouteStore>,
        Arc::new(MemoryTokenStore::new()) as Arc<dyn AgentTokenStore>,
        proxy,
        browser_auth,
        shutdown_token,
    );

    tokio::spawn(run_stale_sweep(
        Arc::clone(&state),
        state.shutdown.clone(),
    ));

    let listener = tokio::spawn(server::serve(Arc::clone(&state)));

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");
    shutdown::run(&state).await;

    listener.await.context("listener task panicked")??;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
