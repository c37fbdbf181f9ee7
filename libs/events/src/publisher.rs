//! Fire-and-forget event publishing.

use tokio::sync::broadcast;
use tracing::debug;

use crate::ChangeEvent;

/// Default capacity of the broadcast buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Publishes change notifications.
///
/// Implementations must not block and must not report delivery failures to
/// the caller.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Publisher backed by a tokio broadcast channel.
///
/// Subscribers that fall behind lose the oldest events; with no subscribers
/// the event is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, event: ChangeEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "Published change event"),
            Err(_) => debug!(event = name, "No subscribers for change event"),
        }
    }
}

/// Publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish(&self, _event: ChangeEvent) {}
}
