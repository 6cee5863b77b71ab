//! Concurrency primitives

mod keyed_mutex;

pub use keyed_mutex::KeyedMutex;

use sy_core::types::{DeploymentId, ServerId};

/// Lock key for a server's connection lifecycle.
pub fn server_key(id: &ServerId) -> String {
    format!("server:{}", id)
}

/// Lock key for a deployment row. Both the dispatcher and the
/// reconciliation engine write deployments through this key; that shared
/// key is the core invariant against lost and duplicate updates.
pub fn deployment_key(id: &DeploymentId) -> String {
    format!("deployment:{}", id)
}
