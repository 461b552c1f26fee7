use std::sync::Arc;

use convoy_providers::Emitter;
use convoy_types::AgentEvent;
use tokio::sync::broadcast;

/// Fan-out hub for canonical agent events.
///
/// Adapters publish through the shared [`Emitter`] handle, which stamps the
/// per-session sequence; consumers take broadcast receivers. Publishing never
/// blocks: subscribers that fall behind lose the oldest buffered events and
/// everyone else keeps receiving.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<AgentEvent>,
    emitter: Arc<Emitter>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        let emitter = Arc::new(Emitter::new(tx.clone()));
        Self { tx, emitter }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publication handle handed to every adapter sharing this hub.
    pub fn emitter(&self) -> Arc<Emitter> {
        self.emitter.clone()
    }

    /// Malformed backend payloads dropped across all adapters on this hub.
    pub fn protocol_mismatches(&self) -> u64 {
        self.emitter.mismatch_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::{EventKind, EventPayload, EventScope};

    #[tokio::test]
    async fn events_reach_subscribers_in_sequence_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        let emitter = hub.emitter();

        emitter
            .emit(
                "ses_1",
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "mock".to_string(),
                    resumed: false,
                },
            )
            .await;
        emitter
            .emit("ses_1", EventScope::TopLevel, EventPayload::SessionIdle {})
            .await;

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.kind(), EventKind::SessionStart);
        assert_eq!(second.kind(), EventKind::SessionIdle);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_harmless() {
        let hub = EventHub::new();
        hub.emitter()
            .emit("ses_1", EventScope::TopLevel, EventPayload::SessionIdle {})
            .await;
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.protocol_mismatches(), 0);
    }

    #[tokio::test]
    async fn mismatch_counter_is_shared_across_handles() {
        let hub = EventHub::new();
        let emitter = hub.emitter();
        emitter.record_mismatch("mock", "unparseable line");
        emitter.record_mismatch("mock", "duplicate begin edge");
        assert_eq!(hub.protocol_mismatches(), 2);
    }
}
