//! Store implementations

pub mod memory;

pub use memory::{MemoryDeploymentStore, MemoryRouteStore, MemoryServerStore, MemoryTokenStore};
