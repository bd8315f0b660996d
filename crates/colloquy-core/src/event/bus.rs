//! Broadcast event bus for distributing `StoreEvent` to UI subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so the store can publish unconditionally.

use colloquy_types::event::StoreEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for session store events.
///
/// Cloning the bus clones the sender, allowing multiple producers and consumers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
