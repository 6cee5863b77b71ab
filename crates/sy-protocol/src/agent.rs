//! Messages exchanged with agents
//!
//! # Message Flow
//!
//! Typical sequence for one agent connection:
//!
//! 1. Agent connects, claiming a server id and presenting a bearer token
//! 2. Orchestrator authenticates and responds with `auth:ok`
//! 3. Orchestrator immediately sends `status:request`; agent answers `status`
//! 4. Orchestrator sends `ping` periodically, agent responds with `pong`
//! 5. Operations: orchestrator sends `command`, agent answers `command:ack`
//!    and later `command:result`
//! 6. Log streaming: `logs:stream:start` / `logs:stream:line` /
//!    `logs:stream:status` / `logs:stream:stop`
//! 7. Shutdown: orchestrator sends `server:shutdown` before draining

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Privileged operation an agent can be asked to perform on a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    /// Download and install an application
    Install,
    /// Start an installed application
    Start,
    /// Stop a running application
    Stop,
    /// Restart a running application
    Restart,
    /// Apply configuration values
    Configure,
    /// Remove an installed application
    Uninstall,
}

impl CommandAction {
    /// Budget an acked command gets before the completion timeout fires.
    ///
    /// Installs perform heavier work (downloads, image builds) and get a long
    /// budget; configure is medium; start/stop/restart/uninstall are quick
    /// service-manager operations.
    pub fn completion_budget(&self, install: Duration, configure: Duration, control: Duration) -> Duration {
        match self {
            CommandAction::Install => install,
            CommandAction::Configure => configure,
            CommandAction::Start
            | CommandAction::Stop
            | CommandAction::Restart
            | CommandAction::Uninstall => control,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandAction::Install => "install",
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Restart => "restart",
            CommandAction::Configure => "configure",
            CommandAction::Uninstall => "uninstall",
        };
        write!(f, "{}", s)
    }
}

/// Outcome an agent reports for a completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The operation completed successfully
    Success,
    /// The operation failed; `message` carries the reason
    Error,
}

/// Lifecycle status of an agent-side log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Stream is live and producing lines
    Started,
    /// Stream ended normally (service stopped, stop-stream received)
    Stopped,
    /// Stream ended because of an agent-side failure
    Error,
}

impl StreamStatus {
    /// Whether this status terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Stopped | StreamStatus::Error)
    }
}

/// Host metrics included in a periodic status push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// CPU utilization, 0.0..=100.0
    pub cpu_percent: f64,
    /// Memory in use, bytes
    pub memory_used: u64,
    /// Total memory, bytes
    pub memory_total: u64,
    /// Disk in use, bytes
    pub disk_used: u64,
    /// Total disk, bytes
    pub disk_total: u64,
}

/// One application's state as seen by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppReport {
    /// Application name, unique per server
    pub app_name: String,
    /// Raw agent-side status string ("running", "stopped", "error", ...)
    pub status: String,
}

/// Periodic status push from an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Host metrics, if the agent collected them this cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    /// Opaque network snapshot (interfaces, addresses), passed through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
    /// Per-application states
    #[serde(default)]
    pub apps: Vec<AppReport>,
}

/// Messages an agent sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// Periodic status push
    #[serde(rename = "status")]
    Status(StatusReport),

    /// Receipt confirmation for a command, distinct from completion
    #[serde(rename = "command:ack")]
    CommandAck {
        command_id: String,
        /// Agent-side receive timestamp, millis since epoch
        received_at: u64,
    },

    /// Terminal outcome of a command
    #[serde(rename = "command:result")]
    CommandResult {
        command_id: String,
        status: ResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// How long the operation took on the agent, millis
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        /// Action-specific payload (e.g. resolved ports after install)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Answer to a one-shot `logs:request`
    #[serde(rename = "logs:result")]
    LogsResult {
        request_id: String,
        #[serde(default)]
        lines: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// One line from a live log stream
    #[serde(rename = "logs:stream:line")]
    LogStreamLine { stream_id: String, line: String },

    /// Stream lifecycle change
    #[serde(rename = "logs:stream:status")]
    LogStreamStatus {
        stream_id: String,
        status: StreamStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Heartbeat response, echoing the ping timestamp
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Messages the orchestrator sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorMessage {
    /// Authentication succeeded; connection is live
    #[serde(rename = "auth:ok")]
    AuthOk {
        /// Protocol version the orchestrator speaks
        version: String,
        /// Interval at which pings will arrive, seconds
        heartbeat_interval: u64,
    },

    /// Dispatch a privileged operation
    #[serde(rename = "command")]
    Command {
        id: String,
        action: CommandAction,
        app_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Ask for an immediate status push
    #[serde(rename = "status:request")]
    StatusRequest,

    /// One-shot log fetch
    #[serde(rename = "logs:request")]
    LogsRequest {
        request_id: String,
        app_name: String,
        /// Number of trailing lines wanted
        lines: u32,
    },

    /// Open a live log stream for a service
    #[serde(rename = "logs:stream:start")]
    LogStreamStart {
        stream_id: String,
        app_name: String,
        /// Resolved service unit name (manifest value, defaults to app name)
        service: String,
    },

    /// Close a live log stream
    #[serde(rename = "logs:stream:stop")]
    LogStreamStop { stream_id: String },

    /// Heartbeat ping
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Orchestrator is draining; expect the socket to close shortly
    #[serde(rename = "server:shutdown")]
    Shutdown,
}
