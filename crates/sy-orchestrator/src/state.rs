//! Shared orchestrator state
//!
//! One `OrchestratorState` is built at startup and shared by every
//! connection task, timer, and sweep. Everything in it is either immutable
//! configuration or internally synchronized.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sy_core::config::OrchestratorConfig;
use sy_core::traits::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};

use crate::auth::{AgentAuthenticator, BrowserAuth};
use crate::broadcast::Broadcaster;
use crate::dispatch::CommandDispatcher;
use crate::logs::LogStreamManager;
use crate::proxy::ProxyManager;
use crate::reconcile::StatusReconciler;
use crate::session::{AgentRegistry, GenerationRegistry};
use crate::sync::KeyedMutex;

pub struct OrchestratorState {
    pub config: OrchestratorConfig,

    // durable rows
    pub servers: Arc<dyn ServerStore>,
    pub deployments: Arc<dyn DeploymentStore>,
    pub routes: Arc<dyn RouteStore>,
    pub agent_tokens: Arc<dyn AgentTokenStore>,

    // live connection state
    pub registry: Arc<AgentRegistry>,
    pub generations: Arc<GenerationRegistry>,
    pub locks: Arc<KeyedMutex>,

    // engines
    pub dispatcher: Arc<CommandDispatcher>,
    pub reconciler: Arc<StatusReconciler>,
    pub logs: Arc<LogStreamManager>,

    // outward surfaces
    pub broadcaster: Arc<Broadcaster>,
    pub proxy: Arc<dyn ProxyManager>,
    pub authenticator: AgentAuthenticator,
    pub browser_auth: Arc<dyn BrowserAuth>,

    /// Cancelled when shutdown begins; every periodic task selects on it.
    pub shutdown: CancellationToken,
}

impl OrchestratorState {
    /// Wire up the state graph. `shutdown` is shared with anything outside
    /// the state that must stop on drain (the proxy reload worker).
    pub fn new(
        config: OrchestratorConfig,
        servers: Arc<dyn ServerStore>,
        deployments: Arc<dyn DeploymentStore>,
        routes: Arc<dyn RouteStore>,
        agent_tokens: Arc<dyn AgentTokenStore>,
        proxy: Arc<dyn ProxyManager>,
        browser_auth: Arc<dyn BrowserAuth>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new());
        let generations = Arc::new(GenerationRegistry::new());
        let locks = Arc::new(KeyedMutex::new());
        let broadcaster = Arc::new(Broadcaster::default());

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&deployments),
            Arc::clone(&locks),
            Arc::clone(&broadcaster),
            config.clone(),
        );
        let reconciler = Arc::new(StatusReconciler::new(
            Arc::clone(&servers),
            Arc::clone(&deployments),
            Arc::clone(&routes),
            Arc::clone(&locks),
            Arc::clone(&proxy),
            Arc::clone(&broadcaster),
        ));
        let logs = Arc::new(LogStreamManager::new(
            Arc::clone(&registry),
            Arc::clone(&deployments),
            config.clone(),
        ));
        let authenticator = AgentAuthenticator::new(
            Arc::clone(&servers),
            Arc::clone(&agent_tokens),
            config.legacy_token_secret.as_bytes().to_vec(),
        );

        Arc::new(Self {
            config,
            servers,
            deployments,
            routes,
            agent_tokens,
            registry,
            generations,
            locks,
            dispatcher,
            reconciler,
            logs,
            broadcaster,
            proxy,
            authenticator,
            browser_auth,
            shutdown,
        })
    }
}
