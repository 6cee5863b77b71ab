//! Reverse-proxy manager seam
//!
//! The orchestrator flips route activity as deployments start and stop, and
//! coalesces the expensive proxy reload: N route flips in one reconciliation
//! batch trigger one reload, not N. The shipping implementation talks to the
//! proxy's admin endpoint over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sy_core::types::DeploymentId;

/// Route control surface of the external reverse proxy.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Activate or deactivate a deployment's user-facing route.
    async fn set_route_active(&self, deployment_id: &DeploymentId, active: bool);

    /// Activate or deactivate the bundled service routes (admin panels,
    /// APIs) registered under a deployment.
    async fn set_service_routes_active_by_deployment(
        &self,
        deployment_id: &DeploymentId,
        active: bool,
    );

    /// Request a reload; calls within the debounce window coalesce into one.
    fn schedule_reload(&self);

    /// Rewrite config and reload immediately, awaiting completion.
    async fn update_and_reload(&self);
}

/// HTTP client for the reverse proxy's admin endpoint.
pub struct HttpProxyClient {
    client: reqwest::Client,
    admin_url: String,
    reload_tx: mpsc::Sender<()>,
}

impl HttpProxyClient {
    /// Create the client and spawn its debounced reload task.
    pub fn new(
        admin_url: impl Into<String>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let admin_url = admin_url.into();
        let client = reqwest::Client::new();

        // capacity 1: a pending wakeup already covers any further requests
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);

        let proxy = Arc::new(Self {
            client,
            admin_url,
            reload_tx,
        });

        let worker = Arc::clone(&proxy);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = reload_rx.recv() => {
                        if msg.is_none() {
                            break;
                        }
                        tokio::time::sleep(debounce).await;
                        // collapse requests that arrived during the window
                        while reload_rx.try_recv().is_ok() {}
                        worker.do_reload().await;
                    }
                }
            }
        });

        proxy
    }

    async fn do_reload(&self) {
        let url = format!("{}/reload", self.admin_url);
        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Proxy reloaded");
            }
            Ok(response) => {
                tracing::error!(status = %response.status(), "Proxy reload failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "Proxy admin endpoint unreachable");
            }
        }
    }

    async fn set_active(&self, path: &str, active: bool) {
        let url = format!("{}{}", self.admin_url, path);
        let body = serde_json::json!({ "active": active });
        if let Err(e) = self.client.put(&url).json(&body).send().await {
            tracing::error!(url, error = %e, "Failed to update proxy route");
        }
    }
}

#[async_trait]
impl ProxyManager for HttpProxyClient {
    async fn set_route_active(&self, deployment_id: &DeploymentId, active: bool) {
        self.set_active(&format!("/routes/deployment/{}", deployment_id), active)
            .await;
    }

    async fn set_service_routes_active_by_deployment(
        &self,
        deployment_id: &DeploymentId,
        active: bool,
    ) {
        self.set_active(&format!("/services/deployment/{}", deployment_id), active)
            .await;
    }

    fn schedule_reload(&self) {
        // a full queue means a reload is already pending; nothing to do
        let _ = self.reload_tx.try_send(());
    }

    async fn update_and_reload(&self) {
        self.do_reload().await;
    }
}
