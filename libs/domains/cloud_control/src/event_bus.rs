//! Bounded ring-buffer pub/sub for lifecycle events (§4.1).
//!
//! Grounded on this workspace's `tauri-plugin-rpc` subscription publisher
//! (`EventPublisher`/`EventSubscriber` naming), but using per-subscriber
//! bounded `mpsc` channels with `try_send` rather than a `broadcast`
//! channel: the spec calls for *drop-for-that-subscriber-only* backpressure,
//! not `broadcast`'s skip-ahead-for-everyone lag semantics.

use crate::models::CloudEvent;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Per-subscriber channel capacity (§4.1 "capacity ~32").
const SUBSCRIBER_CAPACITY: usize = 32;

/// Ring buffer capacity for `Recent`. Not specified numerically by §4.1;
/// sized generously above the SSE replay window (§6, `Recent(20)`).
const RING_BUFFER_CAPACITY: usize = 256;

struct Subscriber {
    sender: mpsc::Sender<CloudEvent>,
}

/// Process-local publish/subscribe channel with a bounded recent-history
/// ring buffer (§4.1). Cheap to clone: internals are behind an `Arc` via
/// `RwLock`-guarded shared state, matching the spec's "subscriber map is
/// protected by a read/write mutex" contract — ring buffer and subscriber
/// map share the one lock so a snapshot of one never diverges from the
/// other under a concurrent `Publish`.
#[derive(Clone)]
pub struct EventBus {
    inner: std::sync::Arc<RwLock<Inner>>,
}

struct Inner {
    subscribers: HashMap<Uuid, Subscriber>,
    ring: VecDeque<CloudEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(RwLock::new(Inner {
                subscribers: HashMap::new(),
                ring: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
            })),
        }
    }

    /// Stamps `id`/`timestamp` if unset, appends to the ring buffer
    /// (evicting the oldest entry when full), then non-blockingly attempts
    /// to deliver to each subscriber. A full subscriber channel drops the
    /// event for that subscriber only — this is the only failure mode, and
    /// it is silent (§4.1 "Failure semantics").
    pub async fn publish(&self, mut event: CloudEvent) {
        if event.id.is_nil() {
            event.id = Uuid::now_v7();
        }

        let mut inner = self.inner.write().await;
        if inner.ring.len() == RING_BUFFER_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        // Snapshot-then-release: a slow receiver's `try_send` never holds
        // the lock, so it can't block registration of new subscribers.
        let targets: Vec<mpsc::Sender<CloudEvent>> =
            inner.subscribers.values().map(|s| s.sender.clone()).collect();
        drop(inner);

        for sender in targets {
            if sender.try_send(event.clone()).is_err() {
                metrics::counter!("cloud_control_event_bus_drops_total").increment(1);
            }
        }
    }

    /// Registers a new bounded subscriber channel.
    pub async fn subscribe(&self) -> (Uuid, mpsc::Receiver<CloudEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = Uuid::now_v7();
        let mut inner = self.inner.write().await;
        inner.subscribers.insert(id, Subscriber { sender: tx });
        (id, rx)
    }

    /// Drops the subscriber's sender, closing its channel. Idempotent.
    pub async fn unsubscribe(&self, subscription_id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.subscribers.remove(&subscription_id);
    }

    /// The last `limit` events from the ring buffer, in chronological
    /// (publish) order.
    pub async fn recent(&self, limit: usize) -> Vec<CloudEvent> {
        let inner = self.inner.read().await;
        let skip = inner.ring.len().saturating_sub(limit);
        inner.ring.iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudEventType;

    fn event(n: u8) -> CloudEvent {
        CloudEvent::new(CloudEventType::InstanceRequested, None, serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn recent_returns_events_in_publish_order() {
        let bus = EventBus::new();
        for n in 0..5u8 {
            bus.publish(event(n)).await;
        }

        let recent = bus.recent(5).await;
        let values: Vec<u8> = recent
            .iter()
            .map(|e| e.data.get("n").and_then(|v| v.as_u64()).unwrap() as u8)
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_when_full() {
        let bus = EventBus::new();
        for n in 0..(RING_BUFFER_CAPACITY as u32 + 10) {
            bus.publish(CloudEvent::new(
                CloudEventType::InstanceRequested,
                None,
                serde_json::json!({ "n": n }),
            ))
            .await;
        }

        let recent = bus.recent(RING_BUFFER_CAPACITY).await;
        assert_eq!(recent.len(), RING_BUFFER_CAPACITY);
        let first = recent.first().unwrap().data.get("n").unwrap().as_u64().unwrap();
        assert_eq!(first, 10);
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe().await;

        bus.publish(event(1)).await;

        let received = rx.recv().await.expect("expected an event");
        assert_eq!(received.data.get("n").unwrap().as_u64().unwrap(), 1);
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_without_blocking_publisher() {
        let bus = EventBus::new();
        let (_id, _rx) = bus.subscribe().await;

        // Fill the subscriber's channel past capacity without ever draining
        // it, then publish one more — this must return promptly rather
        // than block, and the ring buffer must still record every event.
        for n in 0..(SUBSCRIBER_CAPACITY as u32 + 5) {
            bus.publish(CloudEvent::new(
                CloudEventType::InstanceRequested,
                None,
                serde_json::json!({ "n": n }),
            ))
            .await;
        }

        let recent = bus.recent(SUBSCRIBER_CAPACITY + 5).await;
        assert_eq!(recent.len(), SUBSCRIBER_CAPACITY + 5);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_channel() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe().await;
        bus.unsubscribe(id).await;

        bus.publish(event(1)).await;

        assert!(rx.recv().await.is_none());
    }
}
