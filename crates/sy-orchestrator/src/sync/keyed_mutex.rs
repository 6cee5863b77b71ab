//! Per-key asynchronous mutual exclusion
//!
//! Serializes work per key (deployment id, server id) while leaving
//! different keys fully independent. Waiters on one key are woken strictly
//! FIFO: tokio's `Mutex` queues waiters fairly, so commit order per key is
//! the order in which acquisition started.
//!
//! # Single-key discipline
//!
//! No caller may hold two keys at once. Every critical section in this crate
//! takes exactly one key and finishes before any other key is touched; this
//! is what makes deadlock impossible without lock ordering rules.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

struct Entry {
    lock: tokio::sync::Mutex<()>,
    /// Holders plus waiters; the entry is dropped from the map when this
    /// reaches zero
    refs: AtomicUsize,
}

/// Async per-key mutex with refcounted cleanup.
pub struct KeyedMutex {
    entries: StdMutex<HashMap<String, Arc<Entry>>>,
    acquired: AtomicU64,
}

impl KeyedMutex {
    /// Create an empty keyed mutex.
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            acquired: AtomicU64::new(0),
        }
    }

    /// Run `fut` while holding the lock for `key`.
    ///
    /// The lock is released the instant the future settles, success or
    /// failure, and the next FIFO waiter proceeds immediately. Bookkeeping
    /// for the key is dropped once no holder or waiter remains.
    pub async fn run<T, F>(&self, key: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let entry = {
            let mut entries = self.entries.lock().expect("keyed mutex registry poisoned");
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Entry {
                        lock: tokio::sync::Mutex::new(()),
                        refs: AtomicUsize::new(0),
                    })
                })
                .clone();
            // counted while the registry is locked, so cleanup can't race
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry
        };

        let out = {
            let _guard = entry.lock.lock().await;
            self.acquired.fetch_add(1, Ordering::Relaxed);
            fut.await
        };

        let mut entries = self.entries.lock().expect("keyed mutex registry poisoned");
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            entries.remove(key);
        }
        out
    }

    /// Number of keys with a live holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.entries
            .lock()
            .expect("keyed mutex registry poisoned")
            .len()
    }

    /// Total acquisitions since construction. Cheap counter used by the
    /// steady-state tests and periodic stats logging.
    pub fn acquired_total(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}
