use crate::domain::events::{EngineEvent, EventEnvelope};
use chrono::Utc;
use tokio::sync::broadcast;

/// Fan-out bus for engine events: single producer (the coordinator), any
/// number of consumers. Slow or dropped subscribers lag out silently —
/// delivery is best-effort by design.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Stamp and publish an event. A send error only means nobody is
    /// listening, which is fine.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(EventEnvelope {
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
