// Dynamic subscription set.
//
// A widget binds to however many instances its resolution produces; the
// set is a genuine map diffed on every change -- no fixed slot count,
// no artificial upper bound. Every async subscribe carries a
// cancellation token: a teardown that races the in-flight subscribe
// wins, and the late-arriving handle is unsubscribed on the spot
// instead of leaking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skydeck_core::{Topic, WireFrame};

use crate::error::ClientError;

/// Transport seam for establishing one topic subscription.
///
/// In-process deployments bridge straight to the broker (see
/// [`BrokerTransport`]); remote clients implement this over their
/// socket.
#[async_trait]
pub trait SubscribeTransport: Send + Sync {
    /// Subscribe `deliver` to a topic. May await transport readiness.
    async fn subscribe(
        &self,
        topic: &Topic,
        deliver: mpsc::Sender<WireFrame>,
    ) -> Result<SubscriptionHandle, ClientError>;
}

/// A live subscription; dropping it unsubscribes immediately.
pub struct SubscriptionHandle {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

enum Slot {
    /// Subscribe in flight. The epoch distinguishes this attempt from a
    /// later one reusing the key.
    Pending { token: CancellationToken, epoch: u64 },
    Ready(SubscriptionHandle),
}

/// The dynamic topic → subscription map for one widget (or one page).
pub struct SubscriptionSet {
    transport: Arc<dyn SubscribeTransport>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    epochs: AtomicU64,
}

impl SubscriptionSet {
    pub fn new(transport: Arc<dyn SubscribeTransport>) -> Self {
        Self {
            transport,
            slots: Arc::new(Mutex::new(HashMap::new())),
            epochs: AtomicU64::new(1),
        }
    }

    /// Reconcile the live set against the desired topics.
    ///
    /// Stale subscriptions are torn down *before* new ones are started,
    /// so an instance switch never has the old and new subscription
    /// racing to update the same widget.
    pub fn sync(&self, desired: &[Topic], deliver: &mpsc::Sender<WireFrame>) {
        let desired_keys: HashSet<String> = desired.iter().map(Topic::key).collect();

        let mut slots = lock(&self.slots);

        slots.retain(|key, slot| {
            if desired_keys.contains(key) {
                return true;
            }
            debug!(topic = %key, "tearing down stale subscription");
            if let Slot::Pending { token, .. } = slot {
                token.cancel();
            }
            // Dropping a Ready slot runs its teardown synchronously.
            false
        });

        for topic in desired {
            let key = topic.key();
            if slots.contains_key(&key) {
                continue;
            }

            let token = CancellationToken::new();
            let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
            slots.insert(
                key.clone(),
                Slot::Pending {
                    token: token.clone(),
                    epoch,
                },
            );

            tokio::spawn(subscribe_task(
                Arc::clone(&self.transport),
                Arc::clone(&self.slots),
                topic.clone(),
                key,
                deliver.clone(),
                token,
                epoch,
            ));
        }
    }

    /// Tear everything down. Pending subscribes are cancelled; their
    /// late handles will be dropped on arrival.
    pub fn clear(&self) {
        let mut slots = lock(&self.slots);
        for slot in slots.values() {
            if let Slot::Pending { token, .. } = slot {
                token.cancel();
            }
        }
        slots.clear();
    }

    /// Whether a topic key currently has a live (ready) subscription.
    pub fn is_ready(&self, key: &str) -> bool {
        matches!(lock(&self.slots).get(key), Some(Slot::Ready(_)))
    }

    /// Number of tracked subscriptions, pending included.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn subscribe_task(
    transport: Arc<dyn SubscribeTransport>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    topic: Topic,
    key: String,
    deliver: mpsc::Sender<WireFrame>,
    token: CancellationToken,
    epoch: u64,
) {
    let result = transport.subscribe(&topic, deliver).await;

    let mut slots = lock(&slots);
    let current_epoch = match slots.get(&key) {
        Some(Slot::Pending { epoch, .. }) => Some(*epoch),
        _ => None,
    };

    match result {
        Ok(handle) => {
            // Register only if this attempt still owns the slot and was
            // not cancelled while in flight; otherwise the handle drops
            // here, unsubscribing immediately.
            if current_epoch == Some(epoch) && !token.is_cancelled() {
                slots.insert(key, Slot::Ready(handle));
            } else {
                debug!(topic = %key, "subscribe resolved after cancel, unsubscribing");
            }
        }
        Err(e) => {
            warn!(topic = %key, error = %e, "subscribe failed");
            if current_epoch == Some(epoch) {
                slots.remove(&key);
            }
        }
    }
}

fn lock<T>(mutex: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── In-process transport ────────────────────────────────────────────

/// Transport that binds directly to an in-process broker + registry.
pub struct BrokerTransport {
    broker: skydeck_core::TopicBroker,
    registry: skydeck_core::ConnectionRegistry,
    session: uuid::Uuid,
}

impl BrokerTransport {
    pub fn new(
        broker: skydeck_core::TopicBroker,
        registry: skydeck_core::ConnectionRegistry,
    ) -> Self {
        Self {
            broker,
            registry,
            session: uuid::Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl SubscribeTransport for BrokerTransport {
    async fn subscribe(
        &self,
        topic: &Topic,
        deliver: mpsc::Sender<WireFrame>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let lease = self
            .registry
            .acquire(topic)
            .map_err(|e| ClientError::Subscribe(e.to_string()))?;
        let subscription = self.broker.subscribe(topic, self.session, deliver);

        Ok(SubscriptionHandle::new(move || {
            drop(subscription);
            drop(lease);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Transport with a controllable delay, recording call order.
    struct FakeTransport {
        delay: Duration,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SubscribeTransport for FakeTransport {
        async fn subscribe(
            &self,
            topic: &Topic,
            _deliver: mpsc::Sender<WireFrame>,
        ) -> Result<SubscriptionHandle, ClientError> {
            let key = topic.key();
            self.events.lock().expect("lock").push(format!("sub:{key}"));
            tokio::time::sleep(self.delay).await;

            let events = Arc::clone(&self.events);
            Ok(SubscriptionHandle::new(move || {
                events.lock().expect("lock").push(format!("unsub:{key}"));
            }))
        }
    }

    fn setup(delay: Duration) -> (SubscriptionSet, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(FakeTransport {
            delay,
            events: Arc::clone(&events),
        });
        (SubscriptionSet::new(transport), events)
    }

    fn topics(keys: &[&str]) -> Vec<Topic> {
        keys.iter().map(|k| Topic::parse(k).expect(k)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn sync_adds_and_removes_to_match_the_desired_set() {
        let (set, events) = setup(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(8);

        set.sync(&topics(&["jellyfin:a", "jellyfin:b"]), &tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(set.is_ready("jellyfin:a"));
        assert!(set.is_ready("jellyfin:b"));

        set.sync(&topics(&["jellyfin:b"]), &tx);
        assert_eq!(set.len(), 1);
        assert!(!set.is_ready("jellyfin:a"));

        let log = events.lock().expect("lock").clone();
        assert!(log.contains(&"unsub:jellyfin:a".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_teardown_happens_before_the_new_subscribe() {
        let (set, events) = setup(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(8);

        set.sync(&topics(&["jellyfin:old"]), &tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Switch instances: old must be gone before new starts.
        set.sync(&topics(&["jellyfin:new"]), &tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let log = events.lock().expect("lock").clone();
        let unsub_old = log.iter().position(|e| e == "unsub:jellyfin:old");
        let sub_new = log.iter().position(|e| e == "sub:jellyfin:new");
        assert!(
            unsub_old < sub_new,
            "teardown must precede the new subscribe: {log:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_inflight_subscribe_unsubscribes_the_late_handle() {
        let (set, events) = setup(Duration::from_millis(100));
        let (tx, _rx) = mpsc::channel(8);

        set.sync(&topics(&["jellyfin:a"]), &tx);
        // Cancel while the subscribe is still sleeping.
        set.sync(&[], &tx);
        assert!(set.is_empty());

        // Let the in-flight subscribe resolve.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let log = events.lock().expect("lock").clone();
        assert_eq!(log, vec!["sub:jellyfin:a", "unsub:jellyfin:a"]);
        assert!(set.is_empty(), "late handle must not be registered");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_readd_is_not_clobbered_by_the_cancelled_attempt() {
        let (set, events) = setup(Duration::from_millis(100));
        let (tx, _rx) = mpsc::channel(8);

        set.sync(&topics(&["jellyfin:a"]), &tx); // attempt 1
        set.sync(&[], &tx); // cancel it mid-flight
        set.sync(&topics(&["jellyfin:a"]), &tx); // attempt 2

        tokio::time::sleep(Duration::from_millis(250)).await;

        // Attempt 2's handle owns the slot; attempt 1's was discarded.
        assert!(set.is_ready("jellyfin:a"));
        let log = events.lock().expect("lock").clone();
        let unsubs = log.iter().filter(|e| e.starts_with("unsub:")).count();
        assert_eq!(unsubs, 1, "exactly the superseded handle unsubscribes: {log:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn drop_clears_everything() {
        let (set, events) = setup(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(8);

        set.sync(&topics(&["jellyfin:a"]), &tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(set);

        let log = events.lock().expect("lock").clone();
        assert!(log.contains(&"unsub:jellyfin:a".to_owned()));
    }
}
