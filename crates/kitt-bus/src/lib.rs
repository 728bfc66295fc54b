//! In-process publish/subscribe for live log and status events.
//!
//! One topic per stream (a campaign id or a run id). Each subscriber gets a
//! bounded broadcast buffer; when a subscriber falls behind, its oldest
//! events are dropped and the receiver observes how many were lost, which
//! the draining side surfaces as a `dropped=n` marker. Publishers never
//! block on subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kitt_schemas::{StreamEvent, StreamEventKind};
use tokio::sync::broadcast;

/// What a subscriber receives on `recv`.
#[derive(Debug, Clone)]
pub enum BusItem {
    Event(StreamEvent),
    /// The subscriber lagged and `n` events were discarded for it.
    Dropped(u64),
}

/// Handle for one subscription. Dropping it unsubscribes (idempotent).
pub struct Subscription {
    rx: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    /// Next item, or `None` once the topic is closed and drained.
    pub async fn recv(&mut self) -> Option<BusItem> {
        match self.rx.recv().await {
            Ok(ev) => Some(BusItem::Event(ev)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(BusItem::Dropped(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

struct Inner {
    topics: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
    capacity: usize,
}

/// Topic-per-stream event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's buffer (recommended 128).
    pub fn new(capacity: usize) -> Self {
        EventBus {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Publish an event to its stream's topic. Non-blocking; a stream with
    /// no subscribers drops the event silently.
    pub fn publish(&self, event: StreamEvent) {
        let topics = self.inner.topics.lock().expect("bus lock poisoned");
        if let Some(tx) = topics.get(&event.stream_id) {
            // send only fails when there are no receivers; that is fine.
            let _ = tx.send(event);
        }
    }

    /// Convenience constructor + publish.
    pub fn publish_parts(
        &self,
        stream_id: &str,
        sequence: i64,
        kind: StreamEventKind,
        payload: serde_json::Value,
    ) {
        self.publish(StreamEvent {
            stream_id: stream_id.to_string(),
            sequence,
            kind,
            payload,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Subscribe to a stream. The topic is created on first subscription.
    pub fn subscribe(&self, stream_id: &str) -> Subscription {
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        let tx = topics.entry(stream_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(self.inner.capacity);
            tx
        });
        Subscription { rx: tx.subscribe() }
    }

    /// Drop topics nobody listens to anymore. Called opportunistically; a
    /// fresh subscribe recreates the topic.
    pub fn gc(&self) {
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Close every topic; all subscribers observe end-of-stream.
    pub fn shutdown(&self) {
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics.clear();
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().expect("bus lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(stream: &str, seq: i64) -> StreamEvent {
        StreamEvent {
            stream_id: stream.to_string(),
            sequence: seq,
            kind: StreamEventKind::Log,
            payload: json!({"line": format!("l{seq}")}),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("c1");

        bus.publish(ev("c1", 1));
        bus.publish(ev("c1", 2));

        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.sequence, 1),
            other => panic!("unexpected: {other:?}"),
        }
        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.sequence, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_are_isolated() {
        let bus = EventBus::new(8);
        let mut sub_a = bus.subscribe("a");
        let _sub_b = bus.subscribe("b");

        bus.publish(ev("b", 1));
        bus.publish(ev("a", 7));

        match sub_a.recv().await {
            Some(BusItem::Event(e)) => {
                assert_eq!(e.stream_id, "a");
                assert_eq!(e.sequence, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_sees_dropped_marker_not_blockage() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe("c1");

        // Publish far past the buffer without draining; must never block.
        for i in 0..20 {
            bus.publish(ev("c1", i));
        }

        match slow.recv().await {
            Some(BusItem::Dropped(n)) => assert_eq!(n, 16),
            other => panic!("expected dropped marker, got {other:?}"),
        }
        // The remaining buffered events are still delivered.
        match slow.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.sequence, 16),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fast_subscriber_is_unaffected_by_slow_one() {
        let bus = EventBus::new(4);
        let mut fast = bus.subscribe("c1");
        let _slow = bus.subscribe("c1");

        for i in 0..3 {
            bus.publish(ev("c1", i));
            match fast.recv().await {
                Some(BusItem::Event(e)) => assert_eq!(e.sequence, i),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_closes_subscribers() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe("c1");
        bus.shutdown();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn gc_reaps_abandoned_topics() {
        let bus = EventBus::new(4);
        {
            let _sub = bus.subscribe("gone");
        }
        let _kept = bus.subscribe("kept");
        bus.gc();
        assert_eq!(bus.topic_count(), 1);
    }
}
