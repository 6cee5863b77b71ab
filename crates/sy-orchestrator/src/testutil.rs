//! Shared fixtures for in-crate unit tests

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sy_core::config::OrchestratorConfig;
use sy_core::traits::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};
use sy_core::types::{AgentHealth, DeploymentId, ServerId, ServerRecord};

use crate::auth::BrowserAuth;
use crate::proxy::ProxyManager;
use crate::state::OrchestratorState;
use crate::store::{MemoryDeploymentStore, MemoryRouteStore, MemoryServerStore, MemoryTokenStore};

pub(crate) struct NoopProxy;

#[async_trait]
impl ProxyManager for NoopProxy {
    async fn set_route_active(&self, _: &DeploymentId, _: bool) {}
    async fn set_service_routes_active_by_deployment(&self, _: &DeploymentId, _: bool) {}
    fn schedule_reload(&self) {}
    async fn update_and_reload(&self) {}
}

pub(crate) struct AllowAll;

#[async_trait]
impl BrowserAuth for AllowAll {
    async fn validate(&self, _: &str) -> Option<String> {
        Some("test-user".to_string())
    }
}

pub(crate) struct TestState {
    pub state: Arc<OrchestratorState>,
    pub servers: Arc<MemoryServerStore>,
}

pub(crate) fn test_state() -> TestState {
    let servers = Arc::new(MemoryServerStore::new());
    let state = OrchestratorState::new(
        OrchestratorConfig::default(),
        Arc::clone(&servers) as Arc<dyn ServerStore>,
        Arc::new(MemoryDeploymentStore::new()) as Arc<dyn DeploymentStore>,
        Arc::new(MemoryRouteStore::new()) as Arc<dyn RouteStore>,
        Arc::new(MemoryTokenStore::new()) as Arc<dyn AgentTokenStore>,
        Arc::new(NoopProxy),
        Arc::new(AllowAll),
        CancellationToken::new(),
    );
    TestState { state, servers }
}

pub(crate) fn seed_server(fixture: &TestState, id: &str, is_core: bool) {
    fixture.servers.insert(ServerRecord {
        id: ServerId::new(id),
        is_core,
        legacy_token_hash: None,
        health: AgentHealth::Disconnected,
        last_seen: 0,
        metrics: None,
        network: None,
    });
}
