//! The authenticated broadcast room
//!
//! Every authenticated browser connection subscribes here; agent lifecycle,
//! deployment status, and command outcomes fan out to all of them. Sending
//! never blocks and never fails the caller: a room with no listeners just
//! drops the event.

use tokio::sync::broadcast;

use sy_protocol::ServerEvent;

/// Fan-out channel for browser-facing events.
pub struct Broadcaster {
    tx: broadcast::Sender<ServerEvent>,
}

impl Broadcaster {
    /// Create a room with the given buffered capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Join the room.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to every current subscriber.
    pub fn send(&self, event: ServerEvent) {
        // Err means no subscribers; that's a quiet dashboard, not a failure.
        let _ = self.tx.send(event);
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
