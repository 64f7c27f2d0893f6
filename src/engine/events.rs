//! Lifecycle Event Bus
//!
//! Typed broadcast channel for modification lifecycle notifications.
//! Emission never blocks and never fails: with no subscribers the event
//! is dropped, and a slow subscriber only lags its own receiver.

use chrono::Utc;
use tokio::sync::broadcast;

use crate::types::{LifecycleEvent, LifecycleEventKind};

const CHANNEL_CAPACITY: usize = 256;

pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, modification_id: &str, kind: LifecycleEventKind, detail: Option<String>) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(LifecycleEvent {
            modification_id: modification_id.to_string(),
            kind,
            timestamp: Utc::now().to_rfc3339(),
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = LifecycleBus::new();
        let mut rx = bus.subscribe();

        bus.emit("m-1", LifecycleEventKind::Started, None);
        bus.emit(
            "m-1",
            LifecycleEventKind::StateChanged,
            Some("validating".into()),
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, LifecycleEventKind::Started);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, LifecycleEventKind::StateChanged);
        assert_eq!(second.detail.as_deref(), Some("validating"));
    }

    #[test]
    fn test_emit_without_subscribers_is_a_noop() {
        let bus = LifecycleBus::new();
        bus.emit("m-1", LifecycleEventKind::Completed, None);
    }
}
