//! Messages exchanged with browser clients
//!
//! Browser connections are read-mostly: the only client-initiated messages
//! are log subscription management. Everything else flows outward, restricted
//! to clients that passed cookie authentication (the "authenticated room").

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{CommandAction, ResultStatus, StatusReport, StreamStatus};

/// Messages a browser client sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrowserMessage {
    /// Start (or join) a live log stream for a deployment
    #[serde(rename = "subscribe:logs")]
    SubscribeLogs { deployment_id: String },

    /// Leave one stream, or all of this client's streams when `stream_id`
    /// is absent
    #[serde(rename = "unsubscribe:logs")]
    UnsubscribeLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
}

/// Events the orchestrator pushes to authenticated browser clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A deployment's status changed
    #[serde(rename = "deployment:status")]
    DeploymentStatus {
        deployment_id: String,
        /// Status before the change
        previous: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Present only when the deployment has a user-facing route
        #[serde(default, skip_serializing_if = "Option::is_none")]
        route_active: Option<bool>,
    },

    /// Confirmation that a log subscription is live
    #[serde(rename = "deployment:log:subscribed")]
    LogSubscribed {
        stream_id: String,
        deployment_id: String,
    },

    /// One log line from a subscribed stream
    #[serde(rename = "deployment:log")]
    DeploymentLog {
        stream_id: String,
        deployment_id: String,
        line: String,
    },

    /// Stream lifecycle change for a subscribed stream
    #[serde(rename = "deployment:log:status")]
    DeploymentLogStatus {
        stream_id: String,
        deployment_id: String,
        status: StreamStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Log subscription failed (unknown deployment, agent offline)
    #[serde(rename = "deployment:log:error")]
    LogError {
        deployment_id: String,
        message: String,
    },

    /// Raw agent status report, rebroadcast verbatim
    #[serde(rename = "server:status")]
    ServerStatus {
        server_id: String,
        report: StatusReport,
    },

    /// An agent came online
    #[serde(rename = "server:connected")]
    ServerConnected { server_id: String },

    /// An agent went offline
    #[serde(rename = "server:disconnected")]
    ServerDisconnected { server_id: String },

    /// The orchestrator is shutting down
    #[serde(rename = "server:shutdown")]
    ServerShutdown,

    /// A command reached a terminal state
    #[serde(rename = "command:result")]
    CommandResult {
        command_id: String,
        server_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment_id: Option<String>,
        action: CommandAction,
        status: ResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}
