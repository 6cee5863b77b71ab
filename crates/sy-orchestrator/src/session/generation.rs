//! Connection generation registry
//!
//! Tags successive connections per server with a strictly increasing
//! counter. "Newest connection wins" is inherently racy against in-flight
//! messages; any asynchronous continuation that captured "my generation"
//! must test it against `current()` before trusting a late payload.

use dashmap::DashMap;

use sy_core::types::ServerId;

/// Per-server monotonic connection counters.
pub struct GenerationRegistry {
    generations: DashMap<ServerId, u64>,
}

impl GenerationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            generations: DashMap::new(),
        }
    }

    /// Allocate the next generation for a server. Starts at 1.
    pub fn next(&self, server_id: &ServerId) -> u64 {
        let mut entry = self.generations.entry(server_id.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// The generation of the server's current connection, if any was ever
    /// accepted and not cleaned up.
    pub fn current(&self, server_id: &ServerId) -> Option<u64> {
        self.generations.get(server_id).map(|g| *g)
    }

    /// Whether `generation` is still the current one for this server.
    pub fn is_current(&self, server_id: &ServerId, generation: u64) -> bool {
        self.current(server_id) == Some(generation)
    }

    /// Drop bookkeeping only if `generation` is still current, so a
    /// disconnecting old connection can't erase its replacement's tag.
    pub fn cleanup_if_current(&self, server_id: &ServerId, generation: u64) {
        self.generations
            .remove_if(server_id, |_, current| *current == generation);
    }
}

impl Default for GenerationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
