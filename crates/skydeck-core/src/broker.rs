// ── Topic broker ──
//
// Maps topics to subscribed sessions and fans published frames out.
// Delivery is per-subscriber bounded and never blocks the publisher:
// a subscriber whose queue is full is dropped, not waited on. The last
// data/error frame per topic is retained so a late joiner renders
// instantly instead of showing "loading" until the next fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use skydeck_api::{InstanceId, ServiceKind};

use crate::frame::{Payload, WireFrame};
use crate::supervisor::{DegradedReason, SnapshotSink};
use crate::topic::Topic;

/// Topic broker. Cheaply cloneable; all clones share the topic table.
#[derive(Clone)]
pub struct TopicBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    topics: DashMap<String, TopicEntry>,
    next_sub_id: AtomicU64,
}

struct TopicEntry {
    topic: Topic,
    retained: Option<Retained>,
    subscribers: HashMap<u64, Subscriber>,
}

struct Retained {
    payload: Payload,
    at: DateTime<Utc>,
}

struct Subscriber {
    session: Uuid,
    tx: mpsc::Sender<WireFrame>,
}

impl TopicBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: DashMap::new(),
                next_sub_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe a session's delivery queue to a topic.
    ///
    /// The retained frame, if any, is delivered immediately. Dropping
    /// the returned guard stops delivery before it returns -- no frame
    /// is handed to the queue after that point.
    pub fn subscribe(
        &self,
        topic: &Topic,
        session: Uuid,
        tx: mpsc::Sender<WireFrame>,
    ) -> Subscription {
        let key = topic.key();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);

        let mut entry = self
            .inner
            .topics
            .entry(key.clone())
            .or_insert_with(|| TopicEntry {
                topic: topic.clone(),
                retained: None,
                subscribers: HashMap::new(),
            });

        if let Some(ref retained) = entry.retained {
            let frame = WireFrame {
                topic: key.clone(),
                payload: retained.payload.clone(),
            };
            let _ = tx.try_send(frame);
        }

        entry.subscribers.insert(id, Subscriber { session, tx });
        debug!(topic = %key, %session, "subscribed");

        Subscription {
            inner: Arc::clone(&self.inner),
            key,
            id,
        }
    }

    /// Publish a payload to a topic, retaining it per frame policy.
    pub fn publish(&self, topic: &Topic, payload: Payload) {
        let key = topic.key();
        let mut entry = self
            .inner
            .topics
            .entry(key.clone())
            .or_insert_with(|| TopicEntry {
                topic: topic.clone(),
                retained: None,
                subscribers: HashMap::new(),
            });

        if payload.is_retained() {
            entry.retained = Some(Retained {
                payload: payload.clone(),
                at: Utc::now(),
            });
        }
        fan_out(&mut entry, &key, &payload);
    }

    /// Fan a payload to every topic of an instance. Used for lifecycle
    /// broadcasts (degraded, connected) that apply instance-wide.
    fn publish_instance(&self, kind: ServiceKind, instance_id: &InstanceId, payload: &Payload) {
        for mut entry in self.inner.topics.iter_mut() {
            if entry.topic.kind != kind || &entry.topic.instance_id != instance_id {
                continue;
            }
            if payload.is_retained() {
                entry.retained = Some(Retained {
                    payload: payload.clone(),
                    at: Utc::now(),
                });
            }
            let key = entry.key().clone();
            fan_out(&mut entry, &key, payload);
        }
    }

    // ── Introspection ────────────────────────────────────────────

    /// Number of live subscriptions for a topic key.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .topics
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// The retained frame for a topic key, if any.
    pub fn retained(&self, key: &str) -> Option<Payload> {
        self.inner
            .topics
            .get(key)
            .and_then(|entry| entry.retained.as_ref().map(|r| r.payload.clone()))
    }

    /// Age of the retained frame, for staleness diagnostics.
    pub fn retained_age(&self, key: &str) -> Option<chrono::Duration> {
        self.inner
            .topics
            .get(key)
            .and_then(|entry| entry.retained.as_ref().map(|r| Utc::now() - r.at))
    }
}

impl Default for TopicBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver to every subscriber of one entry, evicting the dead and the
/// stuck. `try_send` keeps the publish path non-blocking: a slow
/// subscriber loses its place, not everyone else's latency.
fn fan_out(entry: &mut TopicEntry, key: &str, payload: &Payload) {
    let mut evicted: Vec<u64> = Vec::new();

    for (id, subscriber) in &entry.subscribers {
        let frame = WireFrame {
            topic: key.to_owned(),
            payload: payload.clone(),
        };
        match subscriber.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %key, session = %subscriber.session, "subscriber stuck, dropping");
                evicted.push(*id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                evicted.push(*id);
            }
        }
    }

    for id in evicted {
        entry.subscribers.remove(&id);
    }
}

// The supervisor-facing sink: lifecycle transitions become broadcast
// frames for every topic keyed to the instance.
impl SnapshotSink for TopicBroker {
    fn publish_snapshot(&self, topic: &Topic, data: Value) {
        self.publish(topic, Payload::data(data));
    }

    fn instance_live(&self, kind: ServiceKind, instance_id: &InstanceId) {
        self.publish_instance(kind, instance_id, &Payload::connected());
    }

    fn instance_degraded(
        &self,
        kind: ServiceKind,
        instance_id: &InstanceId,
        reason: DegradedReason,
        message: &str,
    ) {
        self.publish_instance(kind, instance_id, &Payload::error(reason, message));
    }
}

/// Guard for one subscription. Dropping it unsubscribes immediately.
pub struct Subscription {
    inner: Arc<BrokerInner>,
    key: String,
    id: u64,
}

impl Subscription {
    /// The topic key this subscription delivers.
    pub fn topic_key(&self) -> &str {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut entry) = self.inner.topics.get_mut(&self.key) {
            entry.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic() -> Topic {
        Topic::parse("jellyfin:jf-1").expect("topic")
    }

    fn channel() -> (mpsc::Sender<WireFrame>, mpsc::Receiver<WireFrame>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_in_order() {
        let broker = TopicBroker::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        let _sub_a = broker.subscribe(&topic(), Uuid::new_v4(), tx_a);
        let _sub_b = broker.subscribe(&topic(), Uuid::new_v4(), tx_b);

        broker.publish(&topic(), Payload::data(json!(1)));
        broker.publish(&topic(), Payload::data(json!(2)));

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.try_recv().unwrap().payload, Payload::data(json!(1)));
            assert_eq!(rx.try_recv().unwrap().payload, Payload::data(json!(2)));
        }
    }

    #[tokio::test]
    async fn late_joiner_receives_the_retained_frame_immediately() {
        let broker = TopicBroker::new();
        broker.publish(&topic(), Payload::data(json!({ "sessions": 2 })));

        let (tx, mut rx) = channel();
        let _sub = broker.subscribe(&topic(), Uuid::new_v4(), tx);

        let frame = rx.try_recv().expect("retained frame delivered on subscribe");
        assert_eq!(frame.payload, Payload::data(json!({ "sessions": 2 })));
    }

    #[tokio::test]
    async fn connected_frames_are_not_retained() {
        let broker = TopicBroker::new();
        let (tx, _rx) = channel();
        let _sub = broker.subscribe(&topic(), Uuid::new_v4(), tx);

        broker.instance_live(ServiceKind::Jellyfin, &"jf-1".into());
        assert!(broker.retained("jellyfin:jf-1").is_none());

        broker.publish(&topic(), Payload::data(json!(null)));
        assert!(broker.retained("jellyfin:jf-1").is_some());
    }

    #[tokio::test]
    async fn degraded_broadcast_hits_every_topic_of_the_instance() {
        let broker = TopicBroker::new();
        let sessions = Topic::parse("jellyfin:jf-1").expect("topic");
        let library = Topic::parse("jellyfin:library:jf-1").expect("topic");
        let other = Topic::parse("jellyfin:jf-2").expect("topic");

        let (tx_s, mut rx_s) = channel();
        let (tx_l, mut rx_l) = channel();
        let (tx_o, mut rx_o) = channel();
        let _a = broker.subscribe(&sessions, Uuid::new_v4(), tx_s);
        let _b = broker.subscribe(&library, Uuid::new_v4(), tx_l);
        let _c = broker.subscribe(&other, Uuid::new_v4(), tx_o);

        broker.instance_degraded(
            ServiceKind::Jellyfin,
            &"jf-1".into(),
            DegradedReason::Auth,
            "credential rejected",
        );

        for rx in [&mut rx_s, &mut rx_l] {
            let frame = rx.try_recv().expect("error frame");
            assert!(frame.payload.is_error());
        }
        // The other instance's subscribers see nothing.
        assert!(rx_o.try_recv().is_err());
    }

    #[tokio::test]
    async fn stuck_subscriber_is_dropped_without_blocking_the_rest() {
        let broker = TopicBroker::new();
        let (tx_stuck, _rx_stuck) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = channel();

        let _stuck = broker.subscribe(&topic(), Uuid::new_v4(), tx_stuck);
        let _ok = broker.subscribe(&topic(), Uuid::new_v4(), tx_ok);
        assert_eq!(broker.subscriber_count("jellyfin:jf-1"), 2);

        // Fills the stuck subscriber's queue of 1...
        broker.publish(&topic(), Payload::data(json!(1)));
        // ...so this publish overflows it and evicts.
        broker.publish(&topic(), Payload::data(json!(2)));

        assert_eq!(broker.subscriber_count("jellyfin:jf-1"), 1);
        assert_eq!(rx_ok.try_recv().unwrap().payload, Payload::data(json!(1)));
        assert_eq!(rx_ok.try_recv().unwrap().payload, Payload::data(json!(2)));
    }

    #[tokio::test]
    async fn dropping_the_subscription_stops_delivery_immediately() {
        let broker = TopicBroker::new();
        let (tx, mut rx) = channel();
        let sub = broker.subscribe(&topic(), Uuid::new_v4(), tx);

        broker.publish(&topic(), Payload::data(json!(1)));
        drop(sub);
        broker.publish(&topic(), Payload::data(json!(2)));

        assert_eq!(rx.try_recv().unwrap().payload, Payload::data(json!(1)));
        assert!(rx.try_recv().is_err(), "no delivery after unsubscribe");
        assert_eq!(broker.subscriber_count("jellyfin:jf-1"), 0);
    }
}
