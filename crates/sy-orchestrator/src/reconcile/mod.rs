//! Status reconciliation
//!
//! Periodic agent reports are the ground truth for what is actually running.
//! Reconciliation folds each report into the deployment rows and the proxy:
//! row writes and route flips happen under the deployment's keyed lock, so
//! a report can never interleave with a command resolution on the same
//! deployment.
//!
//! Two writes are deliberately lock-free: the server's metrics snapshot and
//! the raw `server:status` rebroadcast. They carry no per-deployment state
//! and must stay cheap at fleet scale. The steady state (every app already
//! in its recorded status) takes zero lock acquisitions per report.

use std::sync::Arc;

use sy_core::time::current_time_millis;
use sy_core::traits::{DeploymentStore, RouteStore, ServerStore};
use sy_core::types::{status_from_report, DeploymentStatus, ServerId};
use sy_protocol::{ServerEvent, StatusReport};

use crate::broadcast::Broadcaster;
use crate::proxy::ProxyManager;
use crate::sync::{deployment_key, KeyedMutex};

/// Folds periodic agent status reports into rows, routes, and the room.
pub struct StatusReconciler {
    servers: Arc<dyn ServerStore>,
    deployments: Arc<dyn DeploymentStore>,
    routes: Arc<dyn RouteStore>,
    locks: Arc<KeyedMutex>,
    proxy: Arc<dyn ProxyManager>,
    broadcaster: Arc<Broadcaster>,
}

impl StatusReconciler {
    pub fn new(
        servers: Arc<dyn ServerStore>,
        deployments: Arc<dyn DeploymentStore>,
        routes: Arc<dyn RouteStore>,
        locks: Arc<KeyedMutex>,
        proxy: Arc<dyn ProxyManager>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            servers,
            deployments,
            routes,
            locks,
            proxy,
            broadcaster,
        }
    }

    /// Ingest one status report from a server's agent.
    pub async fn ingest(&self, server_id: &ServerId, report: StatusReport) {
        // Metrics and the raw rebroadcast never wait on deployment locks.
        if let Err(e) = self
            .servers
            .update_metrics(
                server_id,
                report.metrics.clone(),
                report.network.clone(),
                current_time_millis(),
            )
            .await
        {
            tracing::warn!(server_id = %server_id, error = %e, "Failed to store metrics snapshot");
        }
        self.broadcaster.send(ServerEvent::ServerStatus {
            server_id: server_id.to_string(),
            report: report.clone(),
        });

        let mut changed = false;
        for app in &report.apps {
            if self.reconcile_app(server_id, &app.app_name, &app.status).await {
                changed = true;
            }
        }

        // One coalesced reload per report, however many routes flipped.
        if changed {
            self.proxy.schedule_reload();
        }
    }

    /// Reconcile one reported app status. Returns true when the deployment
    /// row changed (and routes were flipped with it).
    async fn reconcile_app(&self, server_id: &ServerId, app_name: &str, reported: &str) -> bool {
        let deployment = match self.deployments.find_by_server_app(server_id, app_name).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                tracing::debug!(server_id = %server_id, app_name, "Report for unknown app, skipping");
                return false;
            }
            Err(e) => {
                tracing::error!(server_id = %server_id, app_name, error = %e, "Deployment lookup failed");
                return false;
            }
        };

        if !matches!(reported, "running" | "stopped" | "error") {
            tracing::warn!(
                deployment_id = %deployment.id,
                reported,
                "Unrecognized app status, treating as stopped"
            );
        }
        let mapped = status_from_report(reported);

        // Cheap pre-lock filter. A transient row is owned by an in-flight
        // command; an already-matching row needs nothing. Both conditions
        // are re-checked under the lock, this check only avoids taking it.
        if deployment.status.is_transient() || deployment.status == mapped {
            return false;
        }

        let deployment_id = deployment.id.clone();
        self.locks
            .run(&deployment_key(&deployment_id), async {
                // Re-read: a command may have resolved between the filter
                // and lock acquisition.
                let current = match self.deployments.get(&deployment_id).await {
                    Ok(Some(d)) => d,
                    Ok(None) => return false,
                    Err(e) => {
                        tracing::error!(deployment_id = %deployment_id, error = %e, "Deployment re-read failed");
                        return false;
                    }
                };
                if current.status.is_transient() || current.status == mapped {
                    return false;
                }

                if let Err(e) = self
                    .deployments
                    .set_status(&deployment_id, mapped, None)
                    .await
                {
                    tracing::error!(deployment_id = %deployment_id, error = %e, "Deployment status write failed");
                    return false;
                }

                let active = mapped == DeploymentStatus::Running;
                let route = match self.routes.route_for_deployment(&deployment_id).await {
                    Ok(route) => route,
                    Err(e) => {
                        tracing::error!(deployment_id = %deployment_id, error = %e, "Route lookup failed");
                        None
                    }
                };
                if route.is_some() {
                    self.proxy.set_route_active(&deployment_id, active).await;
                }
                self.proxy
                    .set_service_routes_active_by_deployment(&deployment_id, active)
                    .await;

                tracing::info!(
                    deployment_id = %deployment_id,
                    previous = %current.status,
                    status = %mapped,
                    "Reconciled deployment from agent report"
                );

                // Broadcast inside the lock: browsers see transitions in
                // commit order.
                self.broadcaster.send(ServerEvent::DeploymentStatus {
                    deployment_id: deployment_id.to_string(),
                    previous: current.status.as_str().to_string(),
                    status: mapped.as_str().to_string(),
                    message: None,
                    route_active: route.map(|_| active),
                });
                true
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDeploymentStore, MemoryRouteStore, MemoryServerStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use sy_core::types::{
        AgentHealth, DeploymentId, DeploymentRecord, ProxyRouteRecord, ServerRecord,
    };
    use sy_protocol::{AppReport, MetricsSnapshot};

    /// Proxy fake that records every call.
    #[derive(Default)]
    struct RecordingProxy {
        route_flips: StdMutex<Vec<(String, bool)>>,
        service_flips: StdMutex<Vec<(String, bool)>>,
        reloads: AtomicUsize,
    }

    #[async_trait]
    impl ProxyManager for RecordingProxy {
        async fn set_route_active(&self, deployment_id: &DeploymentId, active: bool) {
            self.route_flips
                .lock()
                .unwrap()
                .push((deployment_id.to_string(), active));
        }

        async fn set_service_routes_active_by_deployment(
            &self,
            deployment_id: &DeploymentId,
            active: bool,
        ) {
            self.service_flips
                .lock()
                .unwrap()
                .push((deployment_id.to_string(), active));
        }

        fn schedule_reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }

        async fn update_and_reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        reconciler: StatusReconciler,
        servers: Arc<MemoryServerStore>,
        deployments: Arc<MemoryDeploymentStore>,
        routes: Arc<MemoryRouteStore>,
        locks: Arc<KeyedMutex>,
        proxy: Arc<RecordingProxy>,
        broadcaster: Arc<Broadcaster>,
    }

    fn fixture() -> Fixture {
        let servers = Arc::new(MemoryServerStore::new());
        let deployments = Arc::new(MemoryDeploymentStore::new());
        let routes = Arc::new(MemoryRouteStore::new());
        let locks = Arc::new(KeyedMutex::new());
        let proxy = Arc::new(RecordingProxy::default());
        let broadcaster = Arc::new(Broadcaster::new(64));
        let reconciler = StatusReconciler::new(
            Arc::clone(&servers) as Arc<dyn ServerStore>,
            Arc::clone(&deployments) as Arc<dyn DeploymentStore>,
            Arc::clone(&routes) as Arc<dyn RouteStore>,
            Arc::clone(&locks),
            Arc::clone(&proxy) as Arc<dyn ProxyManager>,
            Arc::clone(&broadcaster),
        );
        servers.insert(ServerRecord {
            id: ServerId::new("srv-1"),
            is_core: false,
            legacy_token_hash: None,
            health: AgentHealth::Connected,
            last_seen: 0,
            metrics: None,
            network: None,
        });
        Fixture {
            reconciler,
            servers,
            deployments,
            routes,
            locks,
            proxy,
            broadcaster,
        }
    }

    fn seed(fixture: &Fixture, id: &str, app: &str, status: DeploymentStatus) {
        fixture.deployments.insert(DeploymentRecord {
            id: DeploymentId::new(id),
            server_id: ServerId::new("srv-1"),
            app_name: app.into(),
            service_name: None,
            status,
            status_message: None,
        });
    }

    fn report(apps: Vec<(&str, &str)>) -> StatusReport {
        StatusReport {
            metrics: None,
            network: None,
            apps: apps
                .into_iter()
                .map(|(app_name, status)| AppReport {
                    app_name: app_name.into(),
                    status: status.into(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_transient_status_never_overwritten() {
        let fixture = fixture();
        seed(&fixture, "d1", "blog", DeploymentStatus::Installing);

        fixture
            .reconciler
            .ingest(&ServerId::new("srv-1"), report(vec![("blog", "stopped")]))
            .await;

        let row = fixture
            .deployments
            .get(&DeploymentId::new("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeploymentStatus::Installing);
        // skipped before the lock, not inside it
        assert_eq!(fixture.locks.acquired_total(), 0);
        assert_eq!(fixture.proxy.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_steady_state_takes_no_locks() {
        let fixture = fixture();
        seed(&fixture, "d1", "blog", DeploymentStatus::Running);
        seed(&fixture, "d2", "wiki", DeploymentStatus::Stopped);

        for _ in 0..10 {
            fixture
                .reconciler
                .ingest(
                    &ServerId::new("srv-1"),
                    report(vec![("blog", "running"), ("wiki", "stopped")]),
                )
                .await;
        }

        assert_eq!(fixture.locks.acquired_total(), 0);
        assert_eq!(fixture.proxy.reloads.load(Ordering::SeqCst), 0);
        assert!(fixture.proxy.route_flips.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_flips_routes_and_reloads_once() {
        let fixture = fixture();
        seed(&fixture, "d1", "blog", DeploymentStatus::Stopped);
        seed(&fixture, "d2", "wiki", DeploymentStatus::Running);
        fixture.routes.insert(ProxyRouteRecord {
            id: "r1".into(),
            deployment_id: DeploymentId::new("d1"),
            active: false,
        });

        let mut room = fixture.broadcaster.subscribe();
        fixture
            .reconciler
            .ingest(
                &ServerId::new("srv-1"),
                report(vec![("blog", "running"), ("wiki", "stopped")]),
            )
            .await;

        assert_eq!(
            fixture
                .deployments
                .get(&DeploymentId::new("d1"))
                .await
                .unwrap()
                .unwrap()
                .status,
            DeploymentStatus::Running
        );
        assert_eq!(
            fixture
                .deployments
                .get(&DeploymentId::new("d2"))
                .await
                .unwrap()
                .unwrap()
                .status,
            DeploymentStatus::Stopped
        );

        // d1 has a user route, d2 does not; service routes flip for both
        assert_eq!(
            *fixture.proxy.route_flips.lock().unwrap(),
            vec![("d1".to_string(), true)]
        );
        assert_eq!(
            *fixture.proxy.service_flips.lock().unwrap(),
            vec![("d1".to_string(), true), ("d2".to_string(), false)]
        );
        // two changes, one reload
        assert_eq!(fixture.proxy.reloads.load(Ordering::SeqCst), 1);

        // room saw the raw report first, then both transitions
        assert!(matches!(
            room.try_recv().unwrap(),
            ServerEvent::ServerStatus { .. }
        ));
        match room.try_recv().unwrap() {
            ServerEvent::DeploymentStatus {
                deployment_id,
                previous,
                status,
                route_active,
                ..
            } => {
                assert_eq!(deployment_id, "d1");
                assert_eq!(previous, "stopped");
                assert_eq!(status, "running");
                assert_eq!(route_active, Some(true));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match room.try_recv().unwrap() {
            ServerEvent::DeploymentStatus {
                deployment_id,
                route_active,
                ..
            } => {
                assert_eq!(deployment_id, "d2");
                // no user route row, so no route_active field
                assert_eq!(route_active, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_metrics_stored_even_when_apps_are_quiet() {
        let fixture = fixture();
        seed(&fixture, "d1", "blog", DeploymentStatus::Installing);

        let mut full = report(vec![("blog", "stopped")]);
        full.metrics = Some(MetricsSnapshot {
            cpu_percent: 12.5,
            memory_used: 1024,
            memory_total: 4096,
            disk_used: 10,
            disk_total: 100,
        });

        let mut room = fixture.broadcaster.subscribe();
        fixture.reconciler.ingest(&ServerId::new("srv-1"), full).await;

        // transient app skipped, metrics landed anyway
        let server = fixture
            .servers
            .get(&ServerId::new("srv-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.metrics.unwrap().cpu_percent, 12.5);
        assert!(matches!(
            room.try_recv().unwrap(),
            ServerEvent::ServerStatus { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_app_and_unknown_status() {
        let fixture = fixture();
        seed(&fixture, "d1", "blog", DeploymentStatus::Running);

        // "ghost" has no row; "restarting" is not in the agent vocabulary
        // and maps to stopped
        fixture
            .reconciler
            .ingest(
                &ServerId::new("srv-1"),
                report(vec![("ghost", "running"), ("blog", "restarting")]),
            )
            .await;

        let row = fixture
            .deployments
            .get(&DeploymentId::new("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeploymentStatus::Stopped);
    }
}
