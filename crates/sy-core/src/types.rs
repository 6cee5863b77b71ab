//! Core domain types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use sy_protocol::{CommandAction, MetricsSnapshot, ResultStatus};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new id
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw id string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Unique identifier for a managed server
    ServerId
}

string_id! {
    /// Unique identifier for a deployment (one app on one server)
    DeploymentId
}

string_id! {
    /// Unique identifier for a dispatched command
    CommandId
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created, nothing dispatched yet
    Pending,
    /// Install command in flight
    Installing,
    /// Configure command in flight
    Configuring,
    /// Application is up
    Running,
    /// Application is installed but not running
    Stopped,
    /// Last operation or the application itself failed
    Error,
    /// Update command in flight
    Updating,
    /// Uninstall command in flight
    Uninstalling,
    /// Uninstalled; the row remains for history
    Removed,
}

impl DeploymentStatus {
    /// Transient states are operator-initiated transitions that stay
    /// authoritative until the command path resolves them. Reconciliation
    /// must never overwrite them from a periodic report.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Installing
                | DeploymentStatus::Configuring
                | DeploymentStatus::Uninstalling
        )
    }

    /// Wire/display form
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Configuring => "configuring",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Updating => "updating",
            DeploymentStatus::Uninstalling => "uninstalling",
            DeploymentStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map a command's terminal result to the deployment status it implies.
///
/// Fixed table: install success leaves the app installed-but-stopped;
/// start/restart success means running; stop success means stopped;
/// uninstall success removes the deployment; any error is an error.
pub fn status_after_result(action: CommandAction, result: ResultStatus) -> DeploymentStatus {
    match result {
        ResultStatus::Error => DeploymentStatus::Error,
        ResultStatus::Success => match action {
            CommandAction::Install => DeploymentStatus::Stopped,
            CommandAction::Start | CommandAction::Restart => DeploymentStatus::Running,
            CommandAction::Stop => DeploymentStatus::Stopped,
            CommandAction::Configure => DeploymentStatus::Stopped,
            CommandAction::Uninstall => DeploymentStatus::Removed,
        },
    }
}

/// Map an agent-reported application status string to a deployment status.
///
/// Anything the orchestrator doesn't recognize maps to `Stopped`; callers
/// log the raw string so new agent vocabulary gets noticed.
pub fn status_from_report(reported: &str) -> DeploymentStatus {
    match reported {
        "running" => DeploymentStatus::Running,
        "stopped" => DeploymentStatus::Stopped,
        "error" => DeploymentStatus::Error,
        _ => DeploymentStatus::Stopped,
    }
}

/// Connection health of a managed server's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    /// No live connection
    Disconnected,
    /// Connection accepted, credentials being checked
    Authenticating,
    /// Authenticated and heartbeating
    Connected,
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentHealth::Disconnected => write!(f, "disconnected"),
            AgentHealth::Authenticating => write!(f, "authenticating"),
            AgentHealth::Connected => write!(f, "connected"),
        }
    }
}

/// A managed server row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    /// The core server hosts the orchestrator itself; its agent connects
    /// over loopback and needs no token
    pub is_core: bool,
    /// Legacy HMAC-SHA256 token hash (hex), superseded by the per-agent
    /// token table but still honored as a fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_token_hash: Option<String>,
    pub health: AgentHealth,
    /// Millis since epoch of the last message from this server's agent
    pub last_seen: u64,
    /// Latest metrics snapshot from the reconciliation engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    /// Opaque network snapshot, passed through to browsers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
}

/// A deployment row: one installed application instance on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub server_id: ServerId,
    /// Application name, unique per server
    pub app_name: String,
    /// Service unit name from the app manifest; defaults to `app_name`
    /// when absent (used by log streaming)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl DeploymentRecord {
    /// Service name the agent should stream logs for.
    pub fn service(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.app_name)
    }
}

/// A user-facing reverse-proxy route row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRouteRecord {
    pub id: String,
    pub deployment_id: DeploymentId,
    pub active: bool,
}

/// A per-agent bearer token row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToken {
    /// SHA-256 hash of the token, hex
    pub token_hash: String,
    /// Millis since epoch; None means no expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Millis since epoch of the last successful authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
}

impl AgentToken {
    /// Whether the token is expired at `now` (millis since epoch).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
