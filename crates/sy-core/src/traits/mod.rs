//! Store traits
//!
//! Persistence is an external collaborator: the orchestrator core only sees
//! these seams. The reference in-memory implementations live in the
//! orchestrator crate; a SQL-backed store plugs in without touching the
//! session, dispatch, or reconciliation code.

mod store;

pub use store::{AgentTokenStore, DeploymentStore, RouteStore, ServerStore};
