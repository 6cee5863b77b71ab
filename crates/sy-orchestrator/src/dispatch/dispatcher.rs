use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use sy_core::config::OrchestratorConfig;
use sy_core::error::CommandError;
use sy_core::time::current_time_millis;
use sy_core::traits::DeploymentStore;
use sy_core::types::{status_after_result, CommandId, DeploymentId, DeploymentStatus, ServerId};
use sy_protocol::{CommandAction, OrchestratorMessage, ResultStatus, ServerEvent};

use crate::broadcast::Broadcaster;
use crate::session::AgentRegistry;
use crate::sync::{deployment_key, KeyedMutex};

/// How many finished commands are kept for inspection.
const RECORD_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Acked,
}

/// Payload of a successful command, handed to `send_and_wait` callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub status: ResultStatus,
    pub message: Option<String>,
    /// Agent-measured duration, millis
    pub duration: Option<u64>,
    pub data: Option<Value>,
}

/// Terminal disposition recorded for every finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Error,
    Timeout,
    Disconnected,
    Aborted,
}

/// Historical entry for a finished command.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub server_id: ServerId,
    pub deployment_id: Option<DeploymentId>,
    pub action: CommandAction,
    pub status: RecordStatus,
    pub message: Option<String>,
    pub finished_at: u64,
}

/// One in-flight command and the timers racing against it.
struct PendingCommand {
    id: CommandId,
    server_id: ServerId,
    deployment_id: Option<DeploymentId>,
    action: CommandAction,
    phase: StdMutex<Phase>,
    ack_timer: StdMutex<Option<JoinHandle<()>>>,
    completion_timer: StdMutex<Option<JoinHandle<()>>>,
    waiter: StdMutex<Option<oneshot::Sender<Result<CommandOutcome, CommandError>>>>,
}

impl PendingCommand {
    fn set_ack_timer(&self, handle: JoinHandle<()>) {
        *self.ack_timer.lock().expect("ack timer slot poisoned") = Some(handle);
    }

    fn set_completion_timer(&self, handle: JoinHandle<()>) {
        *self
            .completion_timer
            .lock()
            .expect("completion timer slot poisoned") = Some(handle);
    }

    fn clear_ack_timer(&self) {
        if let Some(handle) = self.ack_timer.lock().expect("ack timer slot poisoned").take() {
            handle.abort();
        }
    }

    fn clear_timers(&self) {
        self.clear_ack_timer();
        if let Some(handle) = self
            .completion_timer
            .lock()
            .expect("completion timer slot poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Deliver the terminal outcome to the `send_and_wait` caller, if any.
    fn settle(&self, outcome: Result<CommandOutcome, CommandError>) {
        if let Some(tx) = self.waiter.lock().expect("waiter slot poisoned").take() {
            // a dropped receiver just means the caller stopped waiting
            let _ = tx.send(outcome);
        }
    }
}

/// Tracks every in-flight command and drives its ack/complete/timeout
/// state machine.
///
/// Commands leave `pending` through exactly one of: a terminal result from
/// the agent, an ack timeout, a completion timeout, the owning connection
/// disconnecting, or shutdown. Whichever transition removes the entry from
/// the map wins; everything else becomes a logged no-op.
pub struct CommandDispatcher {
    registry: Arc<AgentRegistry>,
    deployments: Arc<dyn DeploymentStore>,
    locks: Arc<KeyedMutex>,
    broadcaster: Arc<Broadcaster>,
    config: OrchestratorConfig,
    pending: DashMap<CommandId, Arc<PendingCommand>>,
    records: DashMap<CommandId, CommandRecord>,
    record_order: StdMutex<std::collections::VecDeque<CommandId>>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        deployments: Arc<dyn DeploymentStore>,
        locks: Arc<KeyedMutex>,
        broadcaster: Arc<Broadcaster>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            deployments,
            locks,
            broadcaster,
            config,
            pending: DashMap::new(),
            records: DashMap::new(),
            record_order: StdMutex::new(std::collections::VecDeque::new()),
        })
    }

    /// Dispatch a command to a server's agent, fire and forget.
    ///
    /// Fails immediately with `Disconnected` when the server has no live
    /// connection; the deployment row is left untouched in that case, since
    /// nothing was ever in flight.
    pub async fn send(
        self: &Arc<Self>,
        server_id: &ServerId,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<DeploymentId>,
        payload: Option<Value>,
    ) -> Result<CommandId, CommandError> {
        self.dispatch(server_id, action, app_name, deployment_id, payload, None)
            .await
    }

    /// Dispatch a command and wait for its terminal outcome.
    pub async fn send_and_wait(
        self: &Arc<Self>,
        server_id: &ServerId,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<DeploymentId>,
        payload: Option<Value>,
    ) -> Result<CommandOutcome, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(server_id, action, app_name, deployment_id, payload, Some(tx))
            .await?;
        // every removal path settles the waiter; a closed channel can only
        // mean the dispatcher itself was dropped mid-flight
        rx.await.unwrap_or(Err(CommandError::ShuttingDown))
    }

    async fn dispatch(
        self: &Arc<Self>,
        server_id: &ServerId,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<DeploymentId>,
        payload: Option<Value>,
        waiter: Option<oneshot::Sender<Result<CommandOutcome, CommandError>>>,
    ) -> Result<CommandId, CommandError> {
        let Some(connection) = self.registry.get(server_id) else {
            tracing::warn!(server_id = %server_id, %action, "Command refused, agent offline");
            return Err(CommandError::Disconnected);
        };

        let id = CommandId::new(Uuid::new_v4().to_string());
        let pending = Arc::new(PendingCommand {
            id: id.clone(),
            server_id: server_id.clone(),
            deployment_id,
            action,
            phase: StdMutex::new(Phase::Pending),
            ack_timer: StdMutex::new(None),
            completion_timer: StdMutex::new(None),
            waiter: StdMutex::new(waiter),
        });
        self.pending.insert(id.clone(), Arc::clone(&pending));

        // Ack timer starts the moment the command is queued, not acked.
        let dispatcher = Arc::clone(self);
        let timer_id = id.clone();
        let ack_timeout = self.config.ack_timeout;
        pending.set_ack_timer(tokio::spawn(async move {
            tokio::time::sleep(ack_timeout).await;
            dispatcher.on_ack_timeout(&timer_id).await;
        }));

        let message = OrchestratorMessage::Command {
            id: id.to_string(),
            action,
            app_name: app_name.to_string(),
            payload,
        };
        if connection.send(message).await.is_err() {
            // the connection closed between lookup and send; same contract
            // as never having had one
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.clear_timers();
                pending.settle(Err(CommandError::Disconnected));
            }
            tracing::warn!(server_id = %server_id, %action, "Command refused, connection closing");
            return Err(CommandError::Disconnected);
        }

        tracing::info!(
            command_id = %id,
            server_id = %server_id,
            %action,
            app_name,
            "Command dispatched"
        );
        Ok(id)
    }

    /// Handle a `command:ack` from an agent.
    ///
    /// Cancels the ack timer and starts the action's completion budget. Acks
    /// for unknown commands or from the wrong server are logged and ignored;
    /// whatever timer is running for the real command keeps running.
    pub async fn handle_ack(self: &Arc<Self>, server_id: &ServerId, command_id: &CommandId, received_at: u64) {
        let Some(pending) = self.pending.get(command_id).map(|r| Arc::clone(&r)) else {
            tracing::warn!(command_id = %command_id, server_id = %server_id, "Ack for unknown command, ignoring");
            return;
        };
        if &pending.server_id != server_id {
            tracing::warn!(
                command_id = %command_id,
                claimed = %server_id,
                owner = %pending.server_id,
                "Ack from wrong server, ignoring"
            );
            return;
        }

        {
            let mut phase = pending.phase.lock().expect("phase poisoned");
            if *phase == Phase::Acked {
                tracing::debug!(command_id = %command_id, "Duplicate ack, ignoring");
                return;
            }
            *phase = Phase::Acked;
        }
        pending.clear_ack_timer();

        let budget = pending.action.completion_budget(
            self.config.install_timeout,
            self.config.configure_timeout,
            self.config.control_timeout,
        );
        let dispatcher = Arc::clone(self);
        let timer_id = command_id.clone();
        pending.set_completion_timer(tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            dispatcher.on_completion_timeout(&timer_id, budget).await;
        }));

        tracing::debug!(command_id = %command_id, received_at, "Command acknowledged");
    }

    /// Handle a `command:result` from an agent.
    ///
    /// A result for a command no longer in `pending` arrived after a timeout
    /// or disconnect already resolved it; it is logged and dropped, and the
    /// deployment keeps its error status.
    pub async fn handle_result(
        self: &Arc<Self>,
        server_id: &ServerId,
        command_id: &CommandId,
        status: ResultStatus,
        message: Option<String>,
        duration: Option<u64>,
        data: Option<Value>,
    ) {
        {
            let Some(pending) = self.pending.get(command_id) else {
                tracing::info!(
                    command_id = %command_id,
                    server_id = %server_id,
                    ?status,
                    "Late result for already-resolved command, dropping"
                );
                return;
            };
            if &pending.server_id != server_id {
                tracing::warn!(
                    command_id = %command_id,
                    claimed = %server_id,
                    owner = %pending.server_id,
                    "Result from wrong server, ignoring"
                );
                return;
            }
        }
        // re-checked: the remove can still lose to a timer firing right now
        let Some((_, pending)) = self.pending.remove(command_id) else {
            tracing::info!(command_id = %command_id, "Command resolved concurrently, dropping result");
            return;
        };
        pending.clear_timers();

        if let Some(deployment_id) = &pending.deployment_id {
            let new_status = status_after_result(pending.action, status);
            self.write_deployment_status(deployment_id, new_status, message.clone())
                .await;
        }

        let record_status = match status {
            ResultStatus::Success => RecordStatus::Success,
            ResultStatus::Error => RecordStatus::Error,
        };
        self.push_record(&pending, record_status, message.clone());

        self.broadcaster.send(ServerEvent::CommandResult {
            command_id: command_id.to_string(),
            server_id: server_id.to_string(),
            deployment_id: pending.deployment_id.as_ref().map(|d| d.to_string()),
            action: pending.action,
            status,
            message: message.clone(),
            data: data.clone(),
        });

        tracing::info!(
            command_id = %command_id,
            server_id = %server_id,
            action = %pending.action,
            ?status,
            duration_ms = duration,
            "Command completed"
        );

        match status {
            ResultStatus::Success => pending.settle(Ok(CommandOutcome {
                status,
                message,
                duration,
                data,
            })),
            ResultStatus::Error => pending.settle(Err(CommandError::AgentReported(
                message.unwrap_or_else(|| "agent reported failure".to_string()),
            ))),
        }
    }

    async fn on_ack_timeout(self: &Arc<Self>, command_id: &CommandId) {
        let Some((_, pending)) = self.pending.remove(command_id) else {
            return; // resolved while the timer was firing
        };
        let message = format!(
            "agent failed to acknowledge within {}s",
            self.config.ack_timeout.as_secs()
        );
        tracing::warn!(
            command_id = %command_id,
            server_id = %pending.server_id,
            action = %pending.action,
            "Command ack timeout"
        );
        self.fail(pending, RecordStatus::Timeout, message).await;
    }

    async fn on_completion_timeout(self: &Arc<Self>, command_id: &CommandId, budget: Duration) {
        let Some((_, pending)) = self.pending.remove(command_id) else {
            return;
        };
        let message = format!("command timed out after {}s", budget.as_secs());
        tracing::warn!(
            command_id = %command_id,
            server_id = %pending.server_id,
            action = %pending.action,
            budget_secs = budget.as_secs(),
            "Command completion timeout"
        );
        self.fail(pending, RecordStatus::Timeout, message).await;
    }

    /// Fail every pending command owned by a server's connection. Runs on
    /// disconnect and on stale-connection reap, through the same
    /// deployment-error path as a timeout.
    pub async fn cleanup_for_server(self: &Arc<Self>, server_id: &ServerId) {
        let ids: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|r| &r.server_id == server_id)
            .map(|r| r.id.clone())
            .collect();

        for id in ids {
            let Some((_, pending)) = self.pending.remove(&id) else {
                continue;
            };
            tracing::warn!(
                command_id = %id,
                server_id = %server_id,
                action = %pending.action,
                "Failing command, agent disconnected"
            );
            self.fail(
                pending,
                RecordStatus::Disconnected,
                "agent disconnected before completing command".to_string(),
            )
            .await;
        }
    }

    /// Abort everything still pending at shutdown. Waiters are rejected
    /// with `ShuttingDown`; deployment rows are deliberately left alone so a
    /// restart can reconcile them from agent reports.
    pub async fn abort_all(&self) {
        let ids: Vec<CommandId> = self.pending.iter().map(|r| r.id.clone()).collect();
        for id in ids {
            let Some((_, pending)) = self.pending.remove(&id) else {
                continue;
            };
            pending.clear_timers();
            self.push_record(&pending, RecordStatus::Aborted, None);
            pending.settle(Err(CommandError::ShuttingDown));
        }
    }

    /// Commands still in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Recorded terminal disposition of a finished command.
    pub fn record(&self, command_id: &CommandId) -> Option<CommandRecord> {
        self.records.get(command_id).map(|r| r.clone())
    }

    /// Shared failure path: timers cleared, deployment marked `error` under
    /// its lock, outcome recorded and broadcast, waiter rejected.
    async fn fail(&self, pending: Arc<PendingCommand>, status: RecordStatus, message: String) {
        pending.clear_timers();

        if let Some(deployment_id) = &pending.deployment_id {
            self.write_deployment_status(deployment_id, DeploymentStatus::Error, Some(message.clone()))
                .await;
        }

        self.push_record(&pending, status, Some(message.clone()));

        self.broadcaster.send(ServerEvent::CommandResult {
            command_id: pending.id.to_string(),
            server_id: pending.server_id.to_string(),
            deployment_id: pending.deployment_id.as_ref().map(|d| d.to_string()),
            action: pending.action,
            status: ResultStatus::Error,
            message: Some(message.clone()),
            data: None,
        });

        let error = match status {
            RecordStatus::Disconnected => CommandError::Disconnected,
            _ => CommandError::Timeout(message),
        };
        pending.settle(Err(error));
    }

    /// Write a deployment's status under its keyed lock and broadcast the
    /// transition from inside the critical section, so browsers observe
    /// changes in commit order.
    async fn write_deployment_status(
        &self,
        deployment_id: &DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) {
        self.locks
            .run(&deployment_key(deployment_id), async {
                let previous = match self.deployments.get(deployment_id).await {
                    Ok(Some(record)) => record.status.as_str().to_string(),
                    Ok(None) => {
                        tracing::warn!(deployment_id = %deployment_id, "Deployment row vanished, skipping status write");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(deployment_id = %deployment_id, error = %e, "Deployment read failed");
                        return;
                    }
                };
                if let Err(e) = self
                    .deployments
                    .set_status(deployment_id, status, message.clone())
                    .await
                {
                    tracing::error!(deployment_id = %deployment_id, error = %e, "Deployment status write failed");
                    return;
                }
                self.broadcaster.send(ServerEvent::DeploymentStatus {
                    deployment_id: deployment_id.to_string(),
                    previous,
                    status: status.as_str().to_string(),
                    message,
                    route_active: None,
                });
            })
            .await;
    }

    fn push_record(&self, pending: &PendingCommand, status: RecordStatus, message: Option<String>) {
        let record = CommandRecord {
            command_id: pending.id.clone(),
            server_id: pending.server_id.clone(),
            deployment_id: pending.deployment_id.clone(),
            action: pending.action,
            status,
            message,
            finished_at: current_time_millis(),
        };
        self.records.insert(pending.id.clone(), record);

        let mut order = self.record_order.lock().expect("record order poisoned");
        order.push_back(pending.id.clone());
        while order.len() > RECORD_CAP {
            if let Some(evicted) = order.pop_front() {
                self.records.remove(&evicted);
            }
        }
    }
}
