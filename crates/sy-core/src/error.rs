//! Core error types for Shipyard

use std::path::PathBuf;
use thiserror::Error;

/// Agent connection authentication failures. All fail closed: the
/// connection is rejected and dropped, never retried here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The claimed server id has no row
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// A core server connected from a non-loopback address
    #[error("Core server must connect from loopback, got {0}")]
    CoreNotLoopback(String),

    /// A non-core server presented no bearer token
    #[error("Missing bearer token")]
    MissingToken,

    /// Token matched neither the token table nor the legacy hash
    #[error("Invalid bearer token")]
    InvalidToken,
}

/// Command lifecycle failures. All converge on the deployment being marked
/// `error`; none are silently dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No live connection for the target server
    #[error("Agent disconnected")]
    Disconnected,

    /// Ack or completion timer fired
    #[error("Command timed out: {0}")]
    Timeout(String),

    /// The agent reported an explicit error result
    #[error("Agent reported failure: {0}")]
    AgentReported(String),

    /// Orchestrator is draining; the command was aborted
    #[error("Shutting down")]
    ShuttingDown,
}

/// Log subscription / one-shot request failures, surfaced to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// No such deployment
    #[error("Unknown deployment: {0}")]
    UnknownDeployment(String),

    /// The deployment's server has no live agent connection
    #[error("Agent offline for server {0}")]
    AgentOffline(String),

    /// One-shot request timed out
    #[error("Log request timed out")]
    Timeout,

    /// Agent disconnected while the request was pending
    #[error("Agent disconnected")]
    Disconnected,

    /// The agent answered with an error
    #[error("Agent error: {0}")]
    AgentReported(String),
}

/// Store-layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend-specific failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
