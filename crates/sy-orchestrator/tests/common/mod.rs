//! Shared fixtures for integration tests

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sy_core::config::OrchestratorConfig;
use sy_core::traits::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};
use sy_core::types::{
    AgentHealth, DeploymentId, DeploymentRecord, DeploymentStatus, ServerId, ServerRecord,
};

use sy_orchestrator::auth::BrowserAuth;
use sy_orchestrator::proxy::ProxyManager;
use sy_orchestrator::state::OrchestratorState;
use sy_orchestrator::store::{
    MemoryDeploymentStore, MemoryRouteStore, MemoryServerStore, MemoryTokenStore,
};

pub struct NoopProxy;

#[async_trait]
impl ProxyManager for NoopProxy {
    async fn set_route_active(&self, _: &DeploymentId, _: bool) {}
    async fn set_service_routes_active_by_deployment(&self, _: &DeploymentId, _: bool) {}
    fn schedule_reload(&self) {}
    async fn update_and_reload(&self) {}
}

pub struct AllowAll;

#[async_trait]
impl BrowserAuth for AllowAll {
    async fn validate(&self, _: &str) -> Option<String> {
        Some("test-user".to_string())
    }
}

pub struct TestHarness {
    pub state: Arc<OrchestratorState>,
    pub servers: Arc<MemoryServerStore>,
    pub deployments: Arc<MemoryDeploymentStore>,
}

pub fn harness() -> TestHarness {
    let servers = Arc::new(MemoryServerStore::new());
    let deployments = Arc::new(MemoryDeploymentStore::new());
    let state = OrchestratorState::new(
        OrchestratorConfig::default(),
        Arc::clone(&servers) as Arc<dyn ServerStore>,
        Arc::clone(&deployments) as Arc<dyn DeploymentStore>,
        Arc::new(MemoryRouteStore::new()) as Arc<dyn RouteStore>,
        Arc::new(MemoryTokenStore::new()) as Arc<dyn AgentTokenStore>,
        Arc::new(NoopProxy),
        Arc::new(AllowAll),
        CancellationToken::new(),
    );
    TestHarness {
        state,
        servers,
        deployments,
    }
}

pub fn seed_server(harness: &TestHarness, id: &str) {
    harness.servers.insert(ServerRecord {
        id: ServerId::new(id),
        is_core: false,
        legacy_token_hash: None,
        health: AgentHealth::Disconnected,
        last_seen: 0,
        metrics: None,
        network: None,
    });
}

pub fn seed_deployment(harness: &TestHarness, id: &str, server: &str, status: DeploymentStatus) {
    harness.deployments.insert(DeploymentRecord {
        id: DeploymentId::new(id),
        server_id: ServerId::new(server),
        app_name: "blog".into(),
        service_name: None,
        status,
        status_message: None,
    });
}
