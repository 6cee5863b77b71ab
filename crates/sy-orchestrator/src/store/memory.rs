//! In-memory reference stores
//!
//! DashMap-backed implementations of the sy-core store traits. These are
//! the stores the daemon boots with (rows seeded from config) and the ones
//! every test uses; a SQL backend would implement the same traits.

use async_trait::async_trait;
use dashmap::DashMap;

use sy_core::error::StoreError;
use sy_core::traits::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};
use sy_core::types::{
    AgentHealth, AgentToken, DeploymentId, DeploymentRecord, DeploymentStatus, ProxyRouteRecord,
    ServerId, ServerRecord,
};
use sy_protocol::MetricsSnapshot;

/// In-memory server rows.
#[derive(Default)]
pub struct MemoryServerStore {
    servers: DashMap<ServerId, ServerRecord>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a row.
    pub fn insert(&self, record: ServerRecord) {
        self.servers.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn get(&self, id: &ServerId) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.servers.get(id).map(|r| r.clone()))
    }

    async fn set_health(
        &self,
        id: &ServerId,
        health: AgentHealth,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        match self.servers.get_mut(id) {
            Some(mut record) => {
                record.health = health;
                record.last_seen = last_seen;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn update_metrics(
        &self,
        id: &ServerId,
        metrics: Option<MetricsSnapshot>,
        network: Option<serde_json::Value>,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        match self.servers.get_mut(id) {
            Some(mut record) => {
                if metrics.is_some() {
                    record.metrics = metrics;
                }
                if network.is_some() {
                    record.network = network;
                }
                record.last_seen = last_seen;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

/// In-memory deployment rows.
#[derive(Default)]
pub struct MemoryDeploymentStore {
    deployments: DashMap<DeploymentId, DeploymentRecord>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a row.
    pub fn insert(&self, record: DeploymentRecord) {
        self.deployments.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn get(&self, id: &DeploymentId) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.deployments.get(id).map(|r| r.clone()))
    }

    async fn find_by_server_app(
        &self,
        server_id: &ServerId,
        app_name: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self
            .deployments
            .iter()
            .find(|r| &r.server_id == server_id && r.app_name == app_name)
            .map(|r| r.clone()))
    }

    async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        match self.deployments.get_mut(id) {
            Some(mut record) => {
                record.status = status;
                record.status_message = message;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

/// In-memory route rows.
#[derive(Default)]
pub struct MemoryRouteStore {
    routes: DashMap<String, ProxyRouteRecord>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a row.
    pub fn insert(&self, record: ProxyRouteRecord) {
        self.routes.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn route_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Option<ProxyRouteRecord>, StoreError> {
        Ok(self
            .routes
            .iter()
            .find(|r| &r.deployment_id == deployment_id)
            .map(|r| r.clone()))
    }
}

/// In-memory per-agent token table.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<ServerId, Vec<AgentToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token to a server's agent.
    pub fn insert(&self, server_id: ServerId, token: AgentToken) {
        self.tokens.entry(server_id).or_default().push(token);
    }
}

#[async_trait]
impl AgentTokenStore for MemoryTokenStore {
    async fn tokens_for(&self, server_id: &ServerId) -> Result<Vec<AgentToken>, StoreError> {
        Ok(self
            .tokens
            .get(server_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn touch(
        &self,
        server_id: &ServerId,
        token_hash: &str,
        used_at: u64,
    ) -> Result<(), StoreError> {
        if let Some(mut tokens) = self.tokens.get_mut(server_id) {
            for token in tokens.iter_mut() {
                if token.token_hash == token_hash {
                    token.last_used = Some(used_at);
                }
            }
        }
        Ok(())
    }
}
