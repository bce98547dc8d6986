use serde_json::Value;
use tokio::sync::broadcast;

use conduit_types::EngineEvent;

const BUS_CAPACITY: usize = 2048;

/// Fan-out of engine events (authorization prompts, tool progress) to UI
/// listeners. Publishing with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: &str, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
