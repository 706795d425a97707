// Stateful instance resolver for one widget binding.
//
// Wraps the pure `resolve()` with the two behaviors that make it safe
// to drive from a live UI:
//
// - Stability: a transient access-read failure or an in-flight refresh
//   returns the last stable decision unchanged. Without this, a
//   reconnect blip would flash every bound widget into "not configured"
//   and -- worse -- persist a wrong fallback.
// - Debounced persistence: a fallback substitution observed continuously
//   for a full window is written back to the widget's stored config,
//   once per distinct value, so later loads start from the corrected id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use skydeck_api::{InstanceId, ServiceKind};
use skydeck_core::Debouncer;

use crate::access::AccessRead;
use crate::error::ClientError;
use crate::resolve::{resolve, FallbackDecision};

/// Persisted widget configuration, as far as this layer cares.
#[async_trait]
pub trait WidgetConfigStore: Send + Sync {
    /// Record the instance a widget fell back to.
    async fn persist_effective_instance(
        &self,
        widget_id: &str,
        instance: &InstanceId,
    ) -> Result<(), ClientError>;
}

/// Resolver state for one widget.
///
/// Driven from the widget's event loop:
///
/// ```rust,ignore
/// loop {
///     tokio::select! {
///         read = access_updates.recv() => {
///             let decision = resolver.observe(&read);
///             // re-bind subscriptions to decision.effective_id
///         }
///         id = resolver.persistence_due() => {
///             resolver.commit_fallback(id).await?;
///         }
///     }
/// }
/// ```
pub struct InstanceResolver {
    widget_id: String,
    compatible: Vec<ServiceKind>,
    store: Arc<dyn WidgetConfigStore>,
    configured: Option<InstanceId>,
    last_stable: Option<FallbackDecision>,
    persist: Debouncer<InstanceId>,
    last_persisted: Option<InstanceId>,
}

impl InstanceResolver {
    pub fn new(
        widget_id: impl Into<String>,
        compatible: Vec<ServiceKind>,
        configured: Option<InstanceId>,
        store: Arc<dyn WidgetConfigStore>,
        persist_window: Duration,
    ) -> Self {
        Self {
            widget_id: widget_id.into(),
            compatible,
            store,
            configured,
            last_stable: None,
            persist: Debouncer::new(persist_window),
            last_persisted: None,
        }
    }

    /// The most recent decision, stable or loading.
    pub fn decision(&self) -> FallbackDecision {
        self.last_stable
            .clone()
            .unwrap_or_else(|| FallbackDecision::loading(self.configured.clone()))
    }

    /// The widget's configuration changed (user picked an instance).
    ///
    /// Drops the stable cache -- the next definitive read recomputes --
    /// and disarms any pending fallback persistence.
    pub fn set_configured(&mut self, configured: Option<InstanceId>) {
        if self.configured != configured {
            self.configured = configured;
            self.last_stable = None;
            self.persist.reset();
        }
    }

    /// Fold one access read into the resolution state.
    ///
    /// Only a definitive `Ready` read produces a new decision; `Loading`
    /// and `Failed` return the cached one unchanged (or a loading
    /// decision if nothing stable exists yet).
    pub fn observe(&mut self, read: &AccessRead) -> FallbackDecision {
        let accessible = match read {
            AccessRead::Ready(accessible) => accessible,
            AccessRead::Loading | AccessRead::Failed => return self.decision(),
        };

        let decision = resolve(self.configured.as_ref(), &self.compatible, accessible);

        match (&decision.effective_id, decision.is_fallback) {
            (Some(effective), true) => self.persist.signal(effective.clone()),
            // Not a fallback (or nothing resolved): a pending
            // persistence would record a decision that no longer holds.
            _ => self.persist.reset(),
        }

        self.last_stable = Some(decision.clone());
        decision
    }

    /// Resolves when a fallback has been observed continuously for the
    /// persistence window. Pends forever while none is in flight.
    pub async fn persistence_due(&mut self) -> InstanceId {
        self.persist.fired().await
    }

    /// Write a debounced fallback to the widget's stored configuration.
    ///
    /// Idempotent per distinct value; also adopts the value as the
    /// configured id so the resolution settles into steady state.
    pub async fn commit_fallback(&mut self, effective: InstanceId) -> Result<bool, ClientError> {
        if self.last_persisted.as_ref() == Some(&effective) {
            return Ok(false);
        }

        self.store
            .persist_effective_instance(&self.widget_id, &effective)
            .await?;
        debug!(widget = %self.widget_id, instance = %effective, "fallback persisted");

        self.last_persisted = Some(effective.clone());
        self.configured = Some(effective);
        if let Some(ref mut decision) = self.last_stable {
            decision.configured_id.clone_from(&self.configured);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::InstanceRef;
    use crate::resolve::FallbackReason;
    use std::sync::Mutex;

    const WINDOW: Duration = Duration::from_millis(500);

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(String, InstanceId)>>,
    }

    #[async_trait]
    impl WidgetConfigStore for RecordingStore {
        async fn persist_effective_instance(
            &self,
            widget_id: &str,
            instance: &InstanceId,
        ) -> Result<(), ClientError> {
            self.writes
                .lock()
                .expect("lock")
                .push((widget_id.to_owned(), instance.clone()));
            Ok(())
        }
    }

    fn refs(ids: &[&str]) -> Vec<InstanceRef> {
        ids.iter()
            .map(|id| InstanceRef {
                id: (*id).into(),
                kind: ServiceKind::Jellyfin,
                name: (*id).to_owned(),
            })
            .collect()
    }

    fn resolver(
        configured: Option<&str>,
        store: Arc<RecordingStore>,
    ) -> InstanceResolver {
        InstanceResolver::new(
            "widget-1",
            vec![ServiceKind::Jellyfin],
            configured.map(InstanceId::from),
            store,
            WINDOW,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_returns_the_cached_decision() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("x"), store);

        let stable = resolver.observe(&AccessRead::Ready(refs(&["x", "y"])));
        assert_eq!(stable.effective_id, Some("x".into()));

        // A failed read must not flash the widget into no_access.
        let during_blip = resolver.observe(&AccessRead::Failed);
        assert_eq!(during_blip, stable);

        // Nor should a refresh-in-flight.
        let during_refresh = resolver.observe(&AccessRead::Loading);
        assert_eq!(during_refresh, stable);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_no_cache_reads_as_loading() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("x"), store);

        let decision = resolver.observe(&AccessRead::Failed);
        assert_eq!(decision.reason, FallbackReason::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_read_replaces_the_cache() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("x"), store);

        resolver.observe(&AccessRead::Ready(refs(&["x"])));
        // x gets un-shared: the definitive empty read is believed.
        let decision = resolver.observe(&AccessRead::Ready(refs(&[])));
        assert_eq!(decision.reason, FallbackReason::NoAccess);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_fallback_persists_once() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("gone"), store.clone());

        resolver.observe(&AccessRead::Ready(refs(&["y"])));
        let due = resolver.persistence_due().await;
        assert_eq!(due, InstanceId::from("y"));
        assert!(resolver.commit_fallback(due).await.expect("commit"));

        assert_eq!(
            *store.writes.lock().expect("lock"),
            vec![("widget-1".to_owned(), InstanceId::from("y"))]
        );

        // The same value again is not re-written.
        assert!(!resolver
            .commit_fallback(InstanceId::from("y"))
            .await
            .expect("commit"));
        assert_eq!(store.writes.lock().expect("lock").len(), 1);

        // And the adopted id makes the next read steady-state.
        let decision = resolver.observe(&AccessRead::Ready(refs(&["y"])));
        assert!(!decision.is_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fallback_is_never_persisted() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("x"), store.clone());

        // Fallback appears...
        resolver.observe(&AccessRead::Ready(refs(&["y"])));
        tokio::time::advance(WINDOW / 2).await;
        // ...but x comes back before the window elapses.
        resolver.observe(&AccessRead::Ready(refs(&["x", "y"])));

        let fired = tokio::time::timeout(WINDOW * 4, resolver.persistence_due()).await;
        assert!(fired.is_err(), "persistence must stay disarmed");
        assert!(store.writes.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_fallback_values_each_persist() {
        let store = Arc::new(RecordingStore::default());
        let mut resolver = resolver(Some("gone"), store.clone());

        resolver.observe(&AccessRead::Ready(refs(&["y"])));
        let due = resolver.persistence_due().await;
        resolver.commit_fallback(due).await.expect("commit");

        // y disappears too; z becomes the fallback.
        resolver.set_configured(Some("gone-again".into()));
        resolver.observe(&AccessRead::Ready(refs(&["z"])));
        let due = resolver.persistence_due().await;
        resolver.commit_fallback(due).await.expect("commit");

        let writes = store.writes.lock().expect("lock").clone();
        assert_eq!(
            writes,
            vec![
                ("widget-1".to_owned(), InstanceId::from("y")),
                ("widget-1".to_owned(), InstanceId::from("z")),
            ]
        );
    }
}
