//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address to bind the WebSocket listener to
    pub bind_address: String,

    /// Interval between heartbeat pings to each agent; the stale-connection
    /// sweep runs at the same interval
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// A connection is reaped when `last_seen` is older than
    /// `heartbeat_interval * stale_multiple`
    pub stale_multiple: u32,

    /// How long a command may sit unacknowledged
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,

    /// Completion budget for install commands (heavy: downloads, builds)
    #[serde(with = "duration_secs")]
    pub install_timeout: Duration,

    /// Completion budget for configure commands
    #[serde(with = "duration_secs")]
    pub configure_timeout: Duration,

    /// Completion budget for start/stop/restart/uninstall commands
    #[serde(with = "duration_secs")]
    pub control_timeout: Duration,

    /// Timeout for one-shot log requests
    #[serde(with = "duration_secs")]
    pub log_request_timeout: Duration,

    /// Debounce window for coalesced proxy reloads
    #[serde(with = "duration_secs")]
    pub reload_debounce: Duration,

    /// How long shutdown waits for pending commands before force-aborting
    #[serde(with = "duration_secs")]
    pub drain_budget: Duration,

    /// Admin endpoint of the reverse proxy (route flips and reloads)
    pub proxy_admin_url: String,

    /// External auth service validating browser session cookies
    pub auth_endpoint: String,

    /// Secret for the legacy HMAC-SHA256 agent token hashes
    pub legacy_token_secret: String,

    /// Servers seeded into the in-memory store at startup
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
}

/// A server row seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSeed {
    pub id: String,
    #[serde(default)]
    pub is_core: bool,
    /// Legacy HMAC token hash (hex), if this server still uses one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_token_hash: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4460".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            stale_multiple: 3,
            ack_timeout: Duration::from_secs(10),
            install_timeout: Duration::from_secs(600),
            configure_timeout: Duration::from_secs(120),
            control_timeout: Duration::from_secs(30),
            log_request_timeout: Duration::from_secs(15),
            reload_debounce: Duration::from_secs(2),
            drain_budget: Duration::from_secs(10),
            proxy_admin_url: "http://127.0.0.1:2019".to_string(),
            auth_endpoint: "http://127.0.0.1:4461/session/validate".to_string(),
            legacy_token_secret: String::new(),
            servers: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Age at which the sweep considers a connection dead.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * self.stale_multiple
    }
}

// Helper module for Duration serialization as whole seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
