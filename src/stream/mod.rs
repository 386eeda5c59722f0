//! Outward event stream.
//!
//! The orchestrator is the only publisher. Events are serialized once and
//! fanned out to every WebSocket subscriber over a broadcast channel;
//! delivery is best-effort.

mod events;
pub mod server;

pub use events::{EventPayload, LifecycleEvent};
pub use server::{AppState, build_router, serve};

use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Sink for lifecycle events.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: &LifecycleEvent);
}

/// Publishes serialized events to all connected stream subscribers.
#[derive(Clone)]
pub struct StreamPublisher {
    tx: broadcast::Sender<String>,
}

impl StreamPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Publisher for StreamPublisher {
    fn publish(&self, event: &LifecycleEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                // No subscribers is fine.
                let receivers = self.tx.send(json).unwrap_or(0);
                trace!(kind = event.payload.kind(), receivers, "event published");
            }
            Err(e) => warn!(error = %e, "failed to serialize lifecycle event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssetId;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let publisher = StreamPublisher::new(16);
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();

        publisher.publish(&LifecycleEvent::now(EventPayload::Error {
            message: "snapshot failed".into(),
            asset_id: Some(AssetId::new("A")),
            needs_operator: false,
        }));

        for rx in [&mut rx1, &mut rx2] {
            let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(json["type"], "error");
            assert_eq!(json["payload"]["message"], "snapshot failed");
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let publisher = StreamPublisher::new(4);
        publisher.publish(&LifecycleEvent::now(EventPayload::Error {
            message: "nobody listening".into(),
            asset_id: None,
            needs_operator: false,
        }));
    }
}
