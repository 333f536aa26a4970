use crate::types::RunEvent;

/// Broadcast bus for run events. Every subscriber sees every event
/// published after it subscribed.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
