// ── Supervisor registry ──
//
// Refcounted supervisor lifecycle: the first subscriber of any topic of
// an instance spawns its supervisor, the last one tears it down. Also
// implements the connection-rebuild capability the reauth coordinator
// signals after rotating a credential.
//
// No teardown grace period: the last release cancels immediately and a
// later acquire respawns. Saving one reconnect on a fast resubscribe is
// not worth blurring the refcount invariant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use skydeck_api::{
    AdapterClient, ConnectionRefresher, InstanceId, InstanceStore, ReauthCoordinator, ServiceKind,
    StreamKind,
};

use crate::error::CoreError;
use crate::supervisor::{
    spawn_supervisor, Command, ConnectionState, SnapshotSink, SupervisorContext, SupervisorHandle,
    SupervisorTuning,
};
use crate::topic::Topic;

/// Refcounted registry of connection supervisors.
///
/// Cheaply cloneable; all clones share the supervisor table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn InstanceStore>,
    sink: Arc<dyn SnapshotSink>,
    tuning: Arc<dyn SupervisorTuning>,
    reauth: OnceLock<Arc<ReauthCoordinator>>,
    supervisors: Mutex<HashMap<(ServiceKind, InstanceId), Entry>>,
}

struct Entry {
    handle: SupervisorHandle,
    /// Subscriptions per stream; a stream with zero refs is removed
    /// from the supervisor's fetch set.
    stream_refs: HashMap<StreamKind, usize>,
    total_refs: usize,
}

impl ConnectionRegistry {
    /// Create a registry and its reauth coordinator, wired together.
    ///
    /// The coordinator signals the registry on credential rotation; the
    /// registry hands the coordinator to every supervisor it spawns.
    pub fn wire(
        store: Arc<dyn InstanceStore>,
        sink: Arc<dyn SnapshotSink>,
        client: AdapterClient,
        tuning: Arc<dyn SupervisorTuning>,
    ) -> (Self, Arc<ReauthCoordinator>) {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                store: Arc::clone(&store),
                sink,
                tuning,
                reauth: OnceLock::new(),
                supervisors: Mutex::new(HashMap::new()),
            }),
        };

        let reauth = Arc::new(
            ReauthCoordinator::new(client, store)
                .with_refresher(Arc::new(registry.clone()) as Arc<dyn ConnectionRefresher>),
        );
        // Freshly-created cell; the set cannot fail.
        let _ = registry.inner.reauth.set(Arc::clone(&reauth));

        (registry, reauth)
    }

    /// Attach a subscriber to a topic, spawning the instance's
    /// supervisor if this is its first subscription.
    ///
    /// The returned lease releases the reference on drop.
    pub fn acquire(&self, topic: &Topic) -> Result<TopicLease, CoreError> {
        let reauth = self
            .inner
            .reauth
            .get()
            .ok_or(CoreError::NotWired("reauth coordinator"))?;

        let mut supervisors = self.lock_supervisors();
        let key = (topic.kind, topic.instance_id.clone());

        match supervisors.get_mut(&key) {
            Some(entry) => {
                entry.total_refs += 1;
                let refs = entry.stream_refs.entry(topic.stream).or_insert(0);
                *refs += 1;
                if *refs == 1 {
                    entry.handle.send_command(Command::AddStream(topic.stream));
                }
            }
            None => {
                info!(kind = %topic.kind, instance = %topic.instance_id, "spawning supervisor");
                let handle = spawn_supervisor(
                    topic.kind,
                    topic.instance_id.clone(),
                    [topic.stream],
                    SupervisorContext {
                        store: Arc::clone(&self.inner.store),
                        reauth: Arc::clone(reauth),
                        sink: Arc::clone(&self.inner.sink),
                        config: self
                            .inner
                            .tuning
                            .supervisor_config(topic.kind, &topic.instance_id),
                    },
                );
                supervisors.insert(
                    key,
                    Entry {
                        handle,
                        stream_refs: HashMap::from([(topic.stream, 1)]),
                        total_refs: 1,
                    },
                );
            }
        }

        Ok(TopicLease {
            registry: self.clone(),
            topic: topic.clone(),
        })
    }

    /// Shut down an instance's supervisor regardless of subscribers.
    ///
    /// For instance deletion/un-sharing: live leases become no-ops and
    /// the next acquire (if the instance reappears) respawns.
    pub fn retire(&self, kind: ServiceKind, instance_id: &InstanceId) {
        let removed = self
            .lock_supervisors()
            .remove(&(kind, instance_id.clone()));
        if let Some(entry) = removed {
            info!(%kind, instance = %instance_id, "retiring supervisor");
            entry.handle.shutdown();
        }
    }

    // ── Introspection ────────────────────────────────────────────

    /// Number of live supervisors.
    pub fn supervisor_count(&self) -> usize {
        self.lock_supervisors().len()
    }

    /// Current connection state of an instance's supervisor.
    pub fn state(&self, kind: ServiceKind, instance_id: &InstanceId) -> Option<ConnectionState> {
        self.lock_supervisors()
            .get(&(kind, instance_id.clone()))
            .map(|entry| entry.handle.state())
    }

    /// Watch an instance supervisor's state transitions.
    pub fn watch_state(
        &self,
        kind: ServiceKind,
        instance_id: &InstanceId,
    ) -> Option<watch::Receiver<ConnectionState>> {
        self.lock_supervisors()
            .get(&(kind, instance_id.clone()))
            .map(|entry| entry.handle.watch_state())
    }

    // ── Internals ────────────────────────────────────────────────

    fn release(&self, topic: &Topic) {
        let mut supervisors = self.lock_supervisors();
        let key = (topic.kind, topic.instance_id.clone());

        let Some(entry) = supervisors.get_mut(&key) else {
            // Already retired; nothing to release.
            return;
        };

        if let Some(refs) = entry.stream_refs.get_mut(&topic.stream) {
            *refs = refs.saturating_sub(1);
            if *refs == 0 {
                entry.stream_refs.remove(&topic.stream);
                entry
                    .handle
                    .send_command(Command::RemoveStream(topic.stream));
            }
        }

        entry.total_refs = entry.total_refs.saturating_sub(1);
        if entry.total_refs == 0 {
            debug!(kind = %topic.kind, instance = %topic.instance_id, "last subscriber gone, shutting down supervisor");
            if let Some(entry) = supervisors.remove(&key) {
                entry.handle.shutdown();
            }
        }
    }

    fn lock_supervisors(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(ServiceKind, InstanceId), Entry>> {
        match self.inner.supervisors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("supervisor table poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }
}

// Credential rotated: tell the supervisor to reopen its channel with
// the fresh credential. Best-effort by contract -- an instance without
// a live supervisor simply has nothing to rebuild.
impl ConnectionRefresher for ConnectionRegistry {
    fn rebuild(&self, kind: ServiceKind, instance_id: &InstanceId) {
        let supervisors = self.lock_supervisors();
        if let Some(entry) = supervisors.get(&(kind, instance_id.clone())) {
            debug!(%kind, instance = %instance_id, "signalling connection rebuild");
            entry.handle.send_command(Command::Rebuild);
        }
    }
}

/// One topic's hold on its instance supervisor. Dropping it releases
/// the reference; the last drop tears the supervisor down.
pub struct TopicLease {
    registry: ConnectionRegistry,
    topic: Topic,
}

impl TopicLease {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        self.registry.release(&self.topic);
    }
}
