//! Domain event bus.
//!
//! Fire-and-forget pub/sub for follow-up notifications such as
//! `inventory.reserved`. Delivery is best effort: a subscriber that lags
//! behind the buffer loses the oldest events, and emitting with no
//! subscribers is not an error.

use crate::context::Correlation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    pub payload: Value,
    pub correlation: Option<Correlation>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event, returning how many subscribers will see it.
    pub fn emit(
        &self,
        name: impl Into<String>,
        payload: Value,
        correlation: Option<Correlation>,
    ) -> usize {
        let event = DomainEvent {
            name: name.into(),
            payload,
            correlation,
        };
        let name = event.name.clone();
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(event = %name, receivers, "Event emitted");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let delivered = bus.emit("inventory.reserved", json!({ "quantity": 1 }), None);
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().name, "inventory.reserved");
        assert_eq!(b.recv().await.unwrap().payload["quantity"], 1);
    }

    #[test]
    fn test_emit_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(4);
        assert_eq!(bus.emit("nobody.listens", Value::Null, None), 0);
    }
}
