//! sy-orchestrator: Fleet orchestrator daemon
//!
//! Accepts WebSocket connections from deployment agents and browsers on one
//! endpoint. Agent connections pass token authentication and register in the
//! session registry (newest connection wins, tagged with a generation);
//! browser connections pass cookie authentication and join the authenticated
//! broadcast room. The command dispatcher drives the ack/complete/timeout
//! state machine for privileged operations, and the reconciliation engine
//! folds periodic agent status pushes into deployment rows and proxy routes.

pub mod auth;
pub mod broadcast;
pub mod dispatch;
pub mod logs;
pub mod proxy;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use state::OrchestratorState;
