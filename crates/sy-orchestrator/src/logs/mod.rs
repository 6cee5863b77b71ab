//! Log streaming
//!
//! Many browsers watch one deployment through a single agent-side stream:
//! the first subscriber opens the stream, later subscribers fan in, and the
//! last one leaving closes it. One-shot log fetches ride the same agent
//! connection with a per-request timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use sy_core::config::OrchestratorConfig;
use sy_core::error::LogError;
use sy_core::traits::DeploymentStore;
use sy_core::types::{DeploymentId, ServerId};
use sy_protocol::{OrchestratorMessage, ServerEvent, StreamStatus};

use crate::session::AgentRegistry;
use crate::sync::KeyedMutex;

/// One live agent-side stream and its browser subscribers.
struct LogStream {
    stream_id: String,
    deployment_id: DeploymentId,
    server_id: ServerId,
    subscribers: StdMutex<HashMap<String, mpsc::Sender<ServerEvent>>>,
}

impl LogStream {
    /// Deliver an event to every subscriber. Slow subscribers lose lines
    /// rather than stalling the stream.
    fn fan_out(&self, event: ServerEvent) {
        let subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        for (client_id, sink) in subscribers.iter() {
            if sink.try_send(event.clone()).is_err() {
                tracing::debug!(client_id, stream_id = %self.stream_id, "Dropping log event for slow subscriber");
            }
        }
    }
}

/// A pending one-shot log fetch.
struct PendingFetch {
    server_id: ServerId,
    waiter: oneshot::Sender<Result<Vec<String>, LogError>>,
}

/// Multiplexes browser log subscriptions onto agent streams.
pub struct LogStreamManager {
    registry: Arc<AgentRegistry>,
    deployments: Arc<dyn DeploymentStore>,
    config: OrchestratorConfig,
    /// Live streams, keyed by deployment: at most one per deployment
    streams: DashMap<DeploymentId, Arc<LogStream>>,
    /// Reverse index from agent-facing stream id to deployment
    by_stream: DashMap<String, DeploymentId>,
    fetches: DashMap<String, PendingFetch>,
    /// Serializes open/close per deployment, so concurrent subscribers
    /// cannot each start an agent-side stream
    locks: KeyedMutex,
}

impl LogStreamManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        deployments: Arc<dyn DeploymentStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            deployments,
            config,
            streams: DashMap::new(),
            by_stream: DashMap::new(),
            fetches: DashMap::new(),
            locks: KeyedMutex::new(),
        }
    }

    /// Subscribe a browser client to a deployment's logs.
    ///
    /// Joins the existing stream when one is live; otherwise asks the
    /// deployment's agent to start one. The subscriber gets a
    /// `deployment:log:subscribed` confirmation on its sink either way.
    pub async fn subscribe(
        &self,
        client_id: &str,
        deployment_id: &DeploymentId,
        sink: mpsc::Sender<ServerEvent>,
    ) -> Result<String, LogError> {
        let deployment = self
            .deployments
            .get(deployment_id)
            .await
            .map_err(|e| {
                tracing::error!(deployment_id = %deployment_id, error = %e, "Deployment lookup failed");
                LogError::UnknownDeployment(deployment_id.to_string())
            })?
            .ok_or_else(|| LogError::UnknownDeployment(deployment_id.to_string()))?;

        // The existing-stream check and the start-stream send are separated
        // by awaits; the lock keeps a concurrent subscriber from slipping
        // between them and starting a second agent-side stream.
        self.locks
            .run(deployment_id.as_str(), async {
                if let Some(stream) = self.streams.get(deployment_id).map(|r| Arc::clone(&r)) {
                    stream
                        .subscribers
                        .lock()
                        .expect("subscriber map poisoned")
                        .insert(client_id.to_string(), sink.clone());
                    let stream_id = stream.stream_id.clone();
                    let _ = sink.try_send(ServerEvent::LogSubscribed {
                        stream_id: stream_id.clone(),
                        deployment_id: deployment_id.to_string(),
                    });
                    tracing::debug!(client_id, stream_id = %stream_id, "Joined existing log stream");
                    return Ok(stream_id);
                }

                let Some(connection) = self.registry.get(&deployment.server_id) else {
                    return Err(LogError::AgentOffline(deployment.server_id.to_string()));
                };

                let stream_id: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect();

                connection
                    .send(OrchestratorMessage::LogStreamStart {
                        stream_id: stream_id.clone(),
                        app_name: deployment.app_name.clone(),
                        service: deployment.service().to_string(),
                    })
                    .await
                    .map_err(|_| LogError::AgentOffline(deployment.server_id.to_string()))?;

                let stream = Arc::new(LogStream {
                    stream_id: stream_id.clone(),
                    deployment_id: deployment_id.clone(),
                    server_id: deployment.server_id.clone(),
                    subscribers: StdMutex::new(HashMap::from([(
                        client_id.to_string(),
                        sink.clone(),
                    )])),
                });
                self.streams.insert(deployment_id.clone(), stream);
                self.by_stream
                    .insert(stream_id.clone(), deployment_id.clone());

                let _ = sink.try_send(ServerEvent::LogSubscribed {
                    stream_id: stream_id.clone(),
                    deployment_id: deployment_id.to_string(),
                });
                tracing::info!(
                    client_id,
                    deployment_id = %deployment_id,
                    stream_id = %stream_id,
                    "Opened log stream"
                );
                Ok(stream_id)
            })
            .await
    }

    /// Drop a client from one stream, or from all of its streams when
    /// `stream_id` is None. The last subscriber leaving closes the
    /// agent-side stream.
    pub async fn unsubscribe(&self, client_id: &str, stream_id: Option<&str>) {
        let targets: Vec<DeploymentId> = match stream_id {
            Some(id) => self.by_stream.get(id).map(|r| r.clone()).into_iter().collect(),
            None => self.streams.iter().map(|r| r.key().clone()).collect(),
        };

        for deployment_id in targets {
            // Same lock as subscribe: a joiner and the last leaver must not
            // interleave, or the joiner lands on a stream being closed.
            self.locks
                .run(deployment_id.as_str(), async {
                    let Some(stream) = self.streams.get(&deployment_id).map(|r| Arc::clone(&r))
                    else {
                        return;
                    };
                    let now_empty = {
                        let mut subscribers =
                            stream.subscribers.lock().expect("subscriber map poisoned");
                        subscribers.remove(client_id);
                        subscribers.is_empty()
                    };
                    if now_empty {
                        self.close_stream(&deployment_id, &stream).await;
                    }
                })
                .await;
        }
    }

    async fn close_stream(&self, deployment_id: &DeploymentId, stream: &LogStream) {
        self.streams.remove(deployment_id);
        self.by_stream.remove(&stream.stream_id);
        if let Some(connection) = self.registry.get(&stream.server_id) {
            let _ = connection
                .send(OrchestratorMessage::LogStreamStop {
                    stream_id: stream.stream_id.clone(),
                })
                .await;
        }
        tracing::info!(stream_id = %stream.stream_id, "Closed log stream, no subscribers left");
    }

    /// Fan one agent log line out to the stream's subscribers.
    pub fn handle_line(&self, server_id: &ServerId, stream_id: &str, line: String) {
        let Some(stream) = self.stream_for(server_id, stream_id) else {
            return;
        };
        stream.fan_out(ServerEvent::DeploymentLog {
            stream_id: stream_id.to_string(),
            deployment_id: stream.deployment_id.to_string(),
            line,
        });
    }

    /// Relay a stream lifecycle change; terminal statuses tear the stream
    /// down on both sides.
    pub fn handle_status(
        &self,
        server_id: &ServerId,
        stream_id: &str,
        status: StreamStatus,
        message: Option<String>,
    ) {
        let Some(stream) = self.stream_for(server_id, stream_id) else {
            return;
        };
        stream.fan_out(ServerEvent::DeploymentLogStatus {
            stream_id: stream_id.to_string(),
            deployment_id: stream.deployment_id.to_string(),
            status,
            message,
        });
        if status.is_terminal() {
            self.streams.remove(&stream.deployment_id);
            self.by_stream.remove(stream_id);
            tracing::info!(stream_id, ?status, "Agent ended log stream");
        }
    }

    fn stream_for(&self, server_id: &ServerId, stream_id: &str) -> Option<Arc<LogStream>> {
        let deployment_id = self.by_stream.get(stream_id).map(|r| r.clone())?;
        let stream = self.streams.get(&deployment_id).map(|r| Arc::clone(&r))?;
        if &stream.server_id != server_id {
            tracing::warn!(
                stream_id,
                claimed = %server_id,
                owner = %stream.server_id,
                "Log event from wrong server, ignoring"
            );
            return None;
        }
        Some(stream)
    }

    /// One-shot fetch of a deployment's trailing log lines.
    pub async fn request_logs(
        &self,
        deployment_id: &DeploymentId,
        lines: u32,
    ) -> Result<Vec<String>, LogError> {
        let deployment = self
            .deployments
            .get(deployment_id)
            .await
            .map_err(|_| LogError::UnknownDeployment(deployment_id.to_string()))?
            .ok_or_else(|| LogError::UnknownDeployment(deployment_id.to_string()))?;
        let Some(connection) = self.registry.get(&deployment.server_id) else {
            return Err(LogError::AgentOffline(deployment.server_id.to_string()));
        };

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.fetches.insert(
            request_id.clone(),
            PendingFetch {
                server_id: deployment.server_id.clone(),
                waiter: tx,
            },
        );

        if connection
            .send(OrchestratorMessage::LogsRequest {
                request_id: request_id.clone(),
                app_name: deployment.app_name.clone(),
                lines,
            })
            .await
            .is_err()
        {
            self.fetches.remove(&request_id);
            return Err(LogError::AgentOffline(deployment.server_id.to_string()));
        }

        match tokio::time::timeout(self.config.log_request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LogError::Disconnected),
            Err(_) => {
                self.fetches.remove(&request_id);
                Err(LogError::Timeout)
            }
        }
    }

    /// Resolve a pending one-shot fetch from an agent's answer.
    pub fn handle_logs_result(
        &self,
        server_id: &ServerId,
        request_id: &str,
        lines: Vec<String>,
        error: Option<String>,
    ) {
        // Check ownership before removing: a forged or misrouted answer must
        // not destroy the legitimate pending fetch.
        {
            let Some(fetch) = self.fetches.get(request_id) else {
                tracing::debug!(request_id, "Answer for unknown or timed-out log request");
                return;
            };
            if &fetch.server_id != server_id {
                tracing::warn!(request_id, claimed = %server_id, "Log answer from wrong server, dropping");
                return;
            }
        }
        let Some((_, fetch)) = self.fetches.remove(request_id) else {
            return;
        };
        let result = match error {
            Some(message) => Err(LogError::AgentReported(message)),
            None => Ok(lines),
        };
        let _ = fetch.waiter.send(result);
    }

    /// Tear down every stream and pending fetch owned by a server. Runs on
    /// disconnect; subscribers get a terminal error status.
    pub async fn cleanup_for_server(&self, server_id: &ServerId) {
        let doomed: Vec<Arc<LogStream>> = self
            .streams
            .iter()
            .filter(|r| &r.server_id == server_id)
            .map(|r| Arc::clone(&r))
            .collect();
        for stream in doomed {
            self.streams.remove(&stream.deployment_id);
            self.by_stream.remove(&stream.stream_id);
            stream.fan_out(ServerEvent::DeploymentLogStatus {
                stream_id: stream.stream_id.clone(),
                deployment_id: stream.deployment_id.to_string(),
                status: StreamStatus::Error,
                message: Some("agent disconnected".to_string()),
            });
        }

        let pending: Vec<String> = self
            .fetches
            .iter()
            .filter(|r| &r.server_id == server_id)
            .map(|r| r.key().clone())
            .collect();
        for request_id in pending {
            if let Some((_, fetch)) = self.fetches.remove(&request_id) {
                let _ = fetch.waiter.send(Err(LogError::Disconnected));
            }
        }
    }

    /// Number of live streams, for stats logging.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AgentConnection;
    use crate::store::MemoryDeploymentStore;
    use sy_core::types::{DeploymentRecord, DeploymentStatus};

    struct Fixture {
        manager: LogStreamManager,
        registry: Arc<AgentRegistry>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(AgentRegistry::new());
        let deployments = Arc::new(MemoryDeploymentStore::new());
        deployments.insert(DeploymentRecord {
            id: DeploymentId::new("d1"),
            server_id: ServerId::new("srv-1"),
            app_name: "blog".into(),
            service_name: Some("blog-web".into()),
            status: DeploymentStatus::Running,
            status_message: None,
        });
        let manager = LogStreamManager::new(
            Arc::clone(&registry),
            deployments as Arc<dyn DeploymentStore>,
            OrchestratorConfig::default(),
        );
        Fixture { manager, registry }
    }

    fn connect(fixture: &Fixture, server: &str) -> mpsc::Receiver<OrchestratorMessage> {
        let (tx, rx) = mpsc::channel(32);
        fixture
            .registry
            .insert(Arc::new(AgentConnection::new(ServerId::new(server), 1, tx)));
        rx
    }

    #[tokio::test]
    async fn test_subscribers_share_one_agent_stream() {
        let fixture = fixture();
        let mut agent_rx = connect(&fixture, "srv-1");
        let server_id = ServerId::new("srv-1");
        let deployment_id = DeploymentId::new("d1");

        let (sink_a, mut rx_a) = mpsc::channel(8);
        let (sink_b, mut rx_b) = mpsc::channel(8);

        let stream_a = fixture
            .manager
            .subscribe("client-a", &deployment_id, sink_a)
            .await
            .unwrap();
        let stream_b = fixture
            .manager
            .subscribe("client-b", &deployment_id, sink_b)
            .await
            .unwrap();
        assert_eq!(stream_a, stream_b);
        assert_eq!(fixture.manager.stream_count(), 1);

        // exactly one start went to the agent, carrying the manifest
        // service name
        match agent_rx.recv().await.unwrap() {
            OrchestratorMessage::LogStreamStart {
                stream_id, service, ..
            } => {
                assert_eq!(stream_id, stream_a);
                assert_eq!(service, "blog-web");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(agent_rx.try_recv().is_err());

        // both sinks got their confirmations
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerEvent::LogSubscribed { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::LogSubscribed { .. }
        ));

        // one line fans out to both
        fixture
            .manager
            .handle_line(&server_id, &stream_a, "hello".into());
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ServerEvent::DeploymentLog { line, .. } => assert_eq!(line, "hello"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_agent_stream() {
        let fixture = fixture();
        let mut agent_rx = connect(&fixture, "srv-1");
        let deployment_id = DeploymentId::new("d1");

        let (sink_a, _rx_a) = mpsc::channel(8);
        let (sink_b, _rx_b) = mpsc::channel(8);
        let stream_id = fixture
            .manager
            .subscribe("client-a", &deployment_id, sink_a)
            .await
            .unwrap();
        fixture
            .manager
            .subscribe("client-b", &deployment_id, sink_b)
            .await
            .unwrap();
        let _ = agent_rx.recv().await; // the start message

        // first leaver does not close the stream
        fixture.manager.unsubscribe("client-a", Some(&stream_id)).await;
        assert_eq!(fixture.manager.stream_count(), 1);
        assert!(agent_rx.try_recv().is_err());

        // last leaver does
        fixture.manager.unsubscribe("client-b", None).await;
        assert_eq!(fixture.manager.stream_count(), 0);
        assert!(matches!(
            agent_rx.recv().await.unwrap(),
            OrchestratorMessage::LogStreamStop { .. }
        ));
    }

    #[tokio::test]
    async fn test_terminal_status_ends_stream() {
        let fixture = fixture();
        let _agent_rx = connect(&fixture, "srv-1");
        let server_id = ServerId::new("srv-1");
        let deployment_id = DeploymentId::new("d1");

        let (sink, mut rx) = mpsc::channel(8);
        let stream_id = fixture
            .manager
            .subscribe("client-a", &deployment_id, sink)
            .await
            .unwrap();
        let _ = rx.recv().await; // subscribed confirmation

        fixture.manager.handle_status(
            &server_id,
            &stream_id,
            StreamStatus::Stopped,
            Some("service stopped".into()),
        );

        match rx.recv().await.unwrap() {
            ServerEvent::DeploymentLogStatus { status, .. } => {
                assert_eq!(status, StreamStatus::Stopped)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(fixture.manager.stream_count(), 0);

        // lines after the end are dropped
        fixture
            .manager
            .handle_line(&server_id, &stream_id, "late".into());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_offline_agent_fails() {
        let fixture = fixture();
        let (sink, _rx) = mpsc::channel(8);
        let err = fixture
            .manager
            .subscribe("client-a", &DeploymentId::new("d1"), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::AgentOffline(_)));

        let (sink, _rx) = mpsc::channel(8);
        let err = fixture
            .manager
            .subscribe("client-a", &DeploymentId::new("ghost"), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::UnknownDeployment(_)));
    }

    #[tokio::test]
    async fn test_one_shot_fetch_round_trip() {
        let fixture = fixture();
        let mut agent_rx = connect(&fixture, "srv-1");
        let server_id = ServerId::new("srv-1");

        let manager = &fixture.manager;
        let deployment_id = DeploymentId::new("d1");
        let fetch = manager.request_logs(&deployment_id, 100);
        tokio::pin!(fetch);

        // drive the request until the agent side sees it
        let request_id = tokio::select! {
            _ = &mut fetch => panic!("fetch resolved before the agent answered"),
            msg = agent_rx.recv() => match msg.unwrap() {
                OrchestratorMessage::LogsRequest { request_id, lines, .. } => {
                    assert_eq!(lines, 100);
                    request_id
                }
                other => panic!("unexpected message: {:?}", other),
            },
        };

        manager.handle_logs_result(&server_id, &request_id, vec!["a".into(), "b".into()], None);
        assert_eq!(fetch.await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_answer_from_wrong_server_is_dropped() {
        let fixture = fixture();
        let mut agent_rx = connect(&fixture, "srv-1");
        let server_id = ServerId::new("srv-1");

        let manager = &fixture.manager;
        let deployment_id = DeploymentId::new("d1");
        let fetch = manager.request_logs(&deployment_id, 50);
        tokio::pin!(fetch);

        let request_id = tokio::select! {
            _ = &mut fetch => panic!("fetch resolved before the agent answered"),
            msg = agent_rx.recv() => match msg.unwrap() {
                OrchestratorMessage::LogsRequest { request_id, .. } => request_id,
                other => panic!("unexpected message: {:?}", other),
            },
        };

        // a forged answer from another server leaves the fetch pending
        manager.handle_logs_result(
            &ServerId::new("srv-2"),
            &request_id,
            vec!["forged".into()],
            None,
        );
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut fetch)
                .await
                .is_err()
        );

        // the owning server's real answer still resolves it
        manager.handle_logs_result(&server_id, &request_id, vec!["real".into()], None);
        assert_eq!(fetch.await.unwrap(), vec!["real".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_start_one_stream() {
        let fixture = fixture();
        let mut agent_rx = connect(&fixture, "srv-1");
        let deployment_id = DeploymentId::new("d1");

        let (sink_a, _rx_a) = mpsc::channel(8);
        let (sink_b, _rx_b) = mpsc::channel(8);
        let (stream_a, stream_b) = tokio::join!(
            fixture.manager.subscribe("client-a", &deployment_id, sink_a),
            fixture.manager.subscribe("client-b", &deployment_id, sink_b),
        );
        assert_eq!(stream_a.unwrap(), stream_b.unwrap());
        assert_eq!(fixture.manager.stream_count(), 1);

        // exactly one start reached the agent
        assert!(matches!(
            agent_rx.recv().await.unwrap(),
            OrchestratorMessage::LogStreamStart { .. }
        ));
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_for_server_errors_subscribers() {
        let fixture = fixture();
        let _agent_rx = connect(&fixture, "srv-1");
        let server_id = ServerId::new("srv-1");

        let (sink, mut rx) = mpsc::channel(8);
        fixture
            .manager
            .subscribe("client-a", &DeploymentId::new("d1"), sink)
            .await
            .unwrap();
        let _ = rx.recv().await; // subscribed confirmation

        fixture.manager.cleanup_for_server(&server_id).await;

        match rx.recv().await.unwrap() {
            ServerEvent::DeploymentLogStatus { status, message, .. } => {
                assert_eq!(status, StreamStatus::Error);
                assert_eq!(message.as_deref(), Some("agent disconnected"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(fixture.manager.stream_count(), 0);
    }
}
