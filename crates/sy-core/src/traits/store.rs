//! Persistence traits for the durable rows
//!
//! Only Server, Deployment, and ProxyRoute rows survive a restart; every
//! other structure the orchestrator holds is in-memory and rebuilt from
//! nothing.

use async_trait::async_trait;

use sy_protocol::MetricsSnapshot;

use crate::error::StoreError;
use crate::types::{
    AgentHealth, AgentToken, DeploymentId, DeploymentRecord, DeploymentStatus, ProxyRouteRecord,
    ServerId, ServerRecord,
};

/// Access to server rows
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Fetch a server row
    async fn get(&self, id: &ServerId) -> Result<Option<ServerRecord>, StoreError>;

    /// Update connection health and last-seen timestamp
    async fn set_health(
        &self,
        id: &ServerId,
        health: AgentHealth,
        last_seen: u64,
    ) -> Result<(), StoreError>;

    /// Update the metrics/network snapshot and last-seen timestamp
    async fn update_metrics(
        &self,
        id: &ServerId,
        metrics: Option<MetricsSnapshot>,
        network: Option<serde_json::Value>,
        last_seen: u64,
    ) -> Result<(), StoreError>;
}

/// Access to deployment rows
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Fetch a deployment row
    async fn get(&self, id: &DeploymentId) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Look up a deployment by its (server, app) pair
    async fn find_by_server_app(
        &self,
        server_id: &ServerId,
        app_name: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Write status and status message
    async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Access to user-facing proxy route rows (read-only here; the Proxy
/// Manager owns mutation)
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// The user-facing route for a deployment, if one exists
    async fn route_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Option<ProxyRouteRecord>, StoreError>;
}

/// Access to the per-agent bearer token table
#[async_trait]
pub trait AgentTokenStore: Send + Sync {
    /// All tokens issued to a server's agent
    async fn tokens_for(&self, server_id: &ServerId) -> Result<Vec<AgentToken>, StoreError>;

    /// Record a successful use of a token
    async fn touch(
        &self,
        server_id: &ServerId,
        token_hash: &str,
        used_at: u64,
    ) -> Result<(), StoreError>;
}
