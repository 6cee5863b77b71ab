//! sy-protocol: Wire protocol for Shipyard
//!
//! Defines the JSON messages exchanged over the shared WebSocket channel.
//! Agents and browsers connect to the same endpoint; the orchestrator routes
//! each connection onto the agent or browser message vocabulary.
//!
//! Every message is a single text frame holding a JSON object with a `type`
//! discriminator (e.g. `"command:ack"`). The codec helpers in [`codec`] do
//! the encode/decode.

pub mod agent;
pub mod browser;
pub mod codec;
pub mod error;

pub use agent::{
    AgentMessage, AppReport, CommandAction, MetricsSnapshot, OrchestratorMessage, ResultStatus,
    StatusReport, StreamStatus,
};
pub use browser::{BrowserMessage, ServerEvent};
pub use error::ProtocolError;

/// Current protocol version string.
///
/// Sent to agents in `auth:ok` so an incompatible agent can bail out early.
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";
