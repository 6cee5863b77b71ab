//! sy-core: Core abstractions for Shipyard
//!
//! Domain types, error taxonomy, configuration loading, time helpers, and
//! the store traits behind which persistence lives. Nothing in this crate
//! touches the network.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{AuthError, CommandError, ConfigError, LogError, StoreError};
pub use types::{
    AgentHealth, AgentToken, CommandId, DeploymentId, DeploymentRecord, DeploymentStatus,
    ProxyRouteRecord, ServerId, ServerRecord,
};
