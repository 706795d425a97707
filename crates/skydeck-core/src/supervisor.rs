// ── Connection supervisor ──
//
// One task per (service kind, instance). Owns the upstream channel --
// push feed where the service supports it, otherwise pure poll -- and
// turns push bursts and reconciliation ticks into snapshot fetches.
// Reconnection is this task's job: subscribers only ever observe state
// transitions, never transport errors.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skydeck_api::{
    adapter_for, spawn_push_feed, AdapterError, InstanceId, InstanceStore, PushPulse,
    ReauthCoordinator, ReconnectConfig, ServiceKind, StreamKind,
};

use crate::debounce::Debouncer;
use crate::stream::StateStream;
use crate::topic::Topic;

const COMMAND_CHANNEL_SIZE: usize = 16;

// ── Connection state ─────────────────────────────────────────────

/// Why a connection is degraded, as surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    /// Credential rejected and recovery exhausted; user action needed.
    Auth,
    /// Instance misconfigured or disabled; user action needed.
    Config,
    /// Upstream unreachable or failing; the supervisor keeps retrying.
    Network,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auth => "auth",
            Self::Config => "config",
            Self::Network => "network",
        })
    }
}

/// Supervisor lifecycle, observable through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Live,
    Degraded(DegradedReason),
    Closed,
}

// ── Configuration ────────────────────────────────────────────────

/// Supervisor timing knobs.
///
/// These are deliberately configuration, not literals: deployments
/// tune them per instance through the config file.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Window for coalescing push-notification bursts into one fetch.
    pub debounce: Duration,
    /// Fixed reconciliation cadence, independent of push activity.
    /// The primary defense against silently-dropped push events.
    pub reconcile_interval: Duration,
    /// First retry delay after a network failure.
    pub backoff_initial: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            reconcile_interval: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Source of supervisor timings, resolved per instance at spawn time.
///
/// The configuration store implements this with its per-instance
/// overrides; a bare [`SupervisorConfig`] applies uniformly.
pub trait SupervisorTuning: Send + Sync {
    fn supervisor_config(&self, kind: ServiceKind, instance_id: &InstanceId) -> SupervisorConfig;
}

impl SupervisorTuning for SupervisorConfig {
    fn supervisor_config(&self, _kind: ServiceKind, _instance_id: &InstanceId) -> SupervisorConfig {
        self.clone()
    }
}

// ── Sink seam ────────────────────────────────────────────────────

/// Where supervisors deliver snapshots and lifecycle transitions.
///
/// Implemented by the topic broker; injected explicitly so supervisor
/// behavior is testable against a recording fake.
pub trait SnapshotSink: Send + Sync {
    /// A snapshot that differs from the last delivered one.
    fn publish_snapshot(&self, topic: &Topic, data: Value);

    /// The upstream channel became live.
    fn instance_live(&self, kind: ServiceKind, instance_id: &InstanceId);

    /// The upstream channel degraded, with the reason and a verbatim
    /// message for operator diagnosis.
    fn instance_degraded(
        &self,
        kind: ServiceKind,
        instance_id: &InstanceId,
        reason: DegradedReason,
        message: &str,
    );
}

// ── Handle ───────────────────────────────────────────────────────

/// Commands the registry sends a running supervisor.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command {
    AddStream(StreamKind),
    RemoveStream(StreamKind),
    /// Credential or config changed: reopen the channel.
    Rebuild,
}

/// Handle to a running supervisor task.
pub struct SupervisorHandle {
    state_rx: watch::Receiver<ConnectionState>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Lifecycle transitions as a `Stream`.
    pub fn state_stream(&self) -> StateStream {
        StateStream::new(self.state_rx.clone())
    }

    pub(crate) fn send_command(&self, command: Command) {
        if let Err(e) = self.cmd_tx.try_send(command) {
            warn!(error = %e, "supervisor command dropped");
        }
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Everything a supervisor needs from the outside.
#[derive(Clone)]
pub(crate) struct SupervisorContext {
    pub store: Arc<dyn InstanceStore>,
    pub reauth: Arc<ReauthCoordinator>,
    pub sink: Arc<dyn SnapshotSink>,
    pub config: SupervisorConfig,
}

/// Spawn the supervisor task for one instance.
pub(crate) fn spawn_supervisor(
    kind: ServiceKind,
    instance_id: InstanceId,
    initial_streams: impl IntoIterator<Item = StreamKind>,
    ctx: SupervisorContext,
) -> SupervisorHandle {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let cancel = CancellationToken::new();

    let task = SupervisorTask {
        kind,
        instance_id,
        ctx,
        streams: initial_streams.into_iter().collect(),
        last: HashMap::new(),
        state_tx,
    };
    tokio::spawn(task.run(cmd_rx, cancel.clone()));

    SupervisorHandle {
        state_rx,
        cmd_tx,
        cancel,
    }
}

// ── Task ─────────────────────────────────────────────────────────

enum Flow {
    Shutdown,
    Rebuild,
}

enum RefreshOutcome {
    Clean,
    Degraded(DegradedReason),
}

struct SupervisorTask {
    kind: ServiceKind,
    instance_id: InstanceId,
    ctx: SupervisorContext,
    streams: BTreeSet<StreamKind>,
    /// Last delivered snapshot per stream, for structural suppression.
    last: HashMap<StreamKind, Value>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SupervisorTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        debug!(kind = %self.kind, instance = %self.instance_id, "supervisor starting");

        loop {
            self.set_state(ConnectionState::Connecting);

            let push_cancel = cancel.child_token();
            let flow = match self.prepare(&push_cancel).await {
                Ok(push_rx) => {
                    self.run_connected(push_rx, &mut cmd_rx, &cancel).await
                }
                Err(err) => {
                    let reason = degraded_reason(&err);
                    self.degrade(reason, &err.to_string());
                    self.wait_for_recovery(reason, &mut cmd_rx, &cancel).await
                }
            };
            push_cancel.cancel();

            match flow {
                Flow::Rebuild => {}
                Flow::Shutdown => break,
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!(kind = %self.kind, instance = %self.instance_id, "supervisor closed");
    }

    /// Load and validate the instance, then open its push feed if the
    /// service supports push.
    async fn prepare(
        &self,
        push_cancel: &CancellationToken,
    ) -> Result<Option<mpsc::Receiver<PushPulse>>, AdapterError> {
        let instance = self.ctx.store.get_instance(&self.instance_id).await?;
        if !instance.enabled {
            return Err(AdapterError::ConfigInvalid {
                message: format!("instance '{}' is disabled", instance.id),
            });
        }

        let adapter = adapter_for(self.kind);
        adapter.validate_config(&instance)?;

        Ok(adapter.push_endpoint(&instance).map(|url| {
            let reconnect = ReconnectConfig {
                initial_delay: self.ctx.config.backoff_initial,
                max_delay: self.ctx.config.backoff_max,
                max_retries: None,
            };
            spawn_push_feed(url, reconnect, push_cancel.clone())
        }))
    }

    /// The live loop: push pulses feed the debouncer, the reconcile
    /// interval fires regardless, network failures retry with backoff.
    async fn run_connected(
        &mut self,
        mut push_rx: Option<mpsc::Receiver<PushPulse>>,
        cmd_rx: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> Flow {
        let mut debouncer: Debouncer<()> = Debouncer::new(self.ctx.config.debounce);

        let mut reconcile = tokio::time::interval(self.ctx.config.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile.tick().await; // consume the immediate first tick

        let mut backoff_attempt: u32 = 0;
        let mut retry_at: Option<Instant> = None;

        // Initial fetch so the first subscriber is not left waiting a
        // full reconcile interval.
        let outcome = self.refresh_all().await;
        self.note_outcome(&outcome, &mut backoff_attempt, &mut retry_at);

        loop {
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => return Flow::Shutdown,

                cmd = cmd_rx.recv() => match cmd {
                    None => return Flow::Shutdown,
                    Some(Command::AddStream(stream)) => {
                        // Fetch soon; the broker's retained frame covers
                        // the subscriber in the meantime.
                        if self.streams.insert(stream) {
                            debouncer.signal(());
                        }
                    }
                    Some(Command::RemoveStream(stream)) => {
                        self.streams.remove(&stream);
                        self.last.remove(&stream);
                    }
                    Some(Command::Rebuild) => return Flow::Rebuild,
                },

                Some(PushPulse) = recv_pulse(&mut push_rx) => {
                    debouncer.signal(());
                }

                () = debouncer.fired() => {
                    let outcome = self.refresh_all().await;
                    self.note_outcome(&outcome, &mut backoff_attempt, &mut retry_at);
                }

                _ = reconcile.tick() => {
                    let outcome = self.refresh_all().await;
                    self.note_outcome(&outcome, &mut backoff_attempt, &mut retry_at);
                }

                () = retry => {
                    retry_at = None;
                    let outcome = self.refresh_all().await;
                    self.note_outcome(&outcome, &mut backoff_attempt, &mut retry_at);
                }
            }
        }
    }

    /// Fetch every active stream, publishing snapshots that changed.
    async fn refresh_all(&mut self) -> RefreshOutcome {
        let adapter = adapter_for(self.kind);
        let streams: Vec<StreamKind> = self.streams.iter().copied().collect();

        for stream in streams {
            let Some(request) = adapter.stream_request(stream) else {
                warn!(kind = %self.kind, %stream, "stream not served by adapter, skipping");
                continue;
            };

            match self.ctx.reauth.request(&self.instance_id, &request).await {
                Ok(value) => self.publish_if_changed(stream, value),
                Err(err) => {
                    let reason = degraded_reason(&err);
                    self.degrade(reason, &err.to_string());
                    return RefreshOutcome::Degraded(reason);
                }
            }
        }

        self.go_live();
        RefreshOutcome::Clean
    }

    fn publish_if_changed(&mut self, stream: StreamKind, value: Value) {
        if self.last.get(&stream) == Some(&value) {
            return;
        }
        let topic = Topic::new(self.kind, stream, self.instance_id.clone());
        debug!(topic = %topic, "snapshot changed, publishing");
        self.ctx.sink.publish_snapshot(&topic, value.clone());
        self.last.insert(stream, value);
    }

    fn note_outcome(
        &self,
        outcome: &RefreshOutcome,
        backoff_attempt: &mut u32,
        retry_at: &mut Option<Instant>,
    ) {
        match outcome {
            RefreshOutcome::Clean => {
                *backoff_attempt = 0;
                *retry_at = None;
            }
            RefreshOutcome::Degraded(DegradedReason::Network) => {
                let delay = backoff_delay(*backoff_attempt, &self.ctx.config);
                debug!(
                    instance = %self.instance_id,
                    delay_ms = delay.as_millis() as u64,
                    attempt = *backoff_attempt,
                    "scheduling network retry"
                );
                *retry_at = Some(Instant::now() + delay);
                *backoff_attempt += 1;
            }
            // Auth and config degradation have nothing useful to retry
            // on a short fuse; the next reconcile tick or a rebuild
            // signal picks them back up.
            RefreshOutcome::Degraded(_) => {
                *retry_at = None;
            }
        }
    }

    /// Park after a failed `prepare` until something changes.
    async fn wait_for_recovery(
        &mut self,
        reason: DegradedReason,
        cmd_rx: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> Flow {
        let retry_delay = self.ctx.config.backoff_initial;
        loop {
            let retry = async move {
                if reason == DegradedReason::Network {
                    tokio::time::sleep(retry_delay).await;
                } else {
                    std::future::pending().await
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Flow::Shutdown,
                cmd = cmd_rx.recv() => match cmd {
                    None => return Flow::Shutdown,
                    Some(Command::AddStream(stream)) => { self.streams.insert(stream); }
                    Some(Command::RemoveStream(stream)) => { self.streams.remove(&stream); }
                    Some(Command::Rebuild) => return Flow::Rebuild,
                },
                () = retry => return Flow::Rebuild,
            }
        }
    }

    // ── State transitions ────────────────────────────────────────

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn go_live(&self) {
        if self.set_state(ConnectionState::Live) {
            self.ctx.sink.instance_live(self.kind, &self.instance_id);
        }
    }

    fn degrade(&self, reason: DegradedReason, message: &str) {
        warn!(
            kind = %self.kind,
            instance = %self.instance_id,
            %reason,
            message,
            "connection degraded"
        );
        if self.set_state(ConnectionState::Degraded(reason)) {
            self.ctx
                .sink
                .instance_degraded(self.kind, &self.instance_id, reason, message);
        }
    }
}

/// Await the next pulse, or pend forever when the service has no push
/// channel (or its feed gave up).
async fn recv_pulse(push_rx: &mut Option<mpsc::Receiver<PushPulse>>) -> Option<PushPulse> {
    match push_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Map an adapter failure to the degraded reason broadcast to widgets.
///
/// Upstream 4xx/5xx land in `Network`: they are retryable from the
/// supervisor's perspective, and the verbatim message still reaches the
/// error broadcast.
fn degraded_reason(err: &AdapterError) -> DegradedReason {
    if err.is_auth_failed() {
        DegradedReason::Auth
    } else if err.is_config() {
        DegradedReason::Config
    } else {
        DegradedReason::Network
    }
}

fn backoff_delay(attempt: u32, config: &SupervisorConfig) -> Duration {
    let base = config.backoff_initial.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(base.min(config.backoff_max.as_secs_f64()))
}
