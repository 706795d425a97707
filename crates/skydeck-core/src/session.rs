// ── Browser session plumbing ──
//
// One `ClientSession` per connected browser. Owns the session's
// subscription map and its bounded outbound queue; the transport layer
// (an axum WebSocket handler) only shuttles text frames in and out.
//
// Wire contract: inbound `{"action": "subscribe"|"unsubscribe",
// "topic": "..."}` control messages, outbound `{topic, payload}` frames.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Subscription, TopicBroker};
use crate::error::CoreError;
use crate::frame::{Payload, WireFrame};
use crate::registry::{ConnectionRegistry, TopicLease};
use crate::supervisor::DegradedReason;
use crate::topic::Topic;

/// Outbound queue depth per session. A browser that stops reading for
/// this many frames is considered stuck and loses its subscriptions
/// rather than backpressuring publishers.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Inbound control message from a browser client.
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// One browser session's subscriptions and outbound queue.
pub struct ClientSession {
    id: Uuid,
    broker: TopicBroker,
    registry: ConnectionRegistry,
    out_tx: mpsc::Sender<WireFrame>,
    /// Keyed by canonical topic key; the guards release the broker
    /// subscription and the supervisor lease on removal.
    subscriptions: HashMap<String, ActiveTopic>,
}

struct ActiveTopic {
    _subscription: Subscription,
    _lease: TopicLease,
}

impl ClientSession {
    /// Create a session and its outbound frame queue.
    ///
    /// The caller (transport layer) drains the receiver into the socket.
    pub fn new(broker: TopicBroker, registry: ConnectionRegistry) -> (Self, mpsc::Receiver<WireFrame>) {
        let (out_tx, out_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let session = Self {
            id: Uuid::new_v4(),
            broker,
            registry,
            out_tx,
            subscriptions: HashMap::new(),
        };
        (session, out_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Handle one raw inbound text frame.
    ///
    /// Malformed messages and unknown topics answer with an error frame
    /// on the session's own queue; they never tear the session down.
    pub fn handle_control(&mut self, raw: &str) {
        let message: ControlMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(session = %self.id, error = %e, "malformed control message");
                self.send_error("", format!("malformed control message: {e}"));
                return;
            }
        };

        match message.action {
            ControlAction::Subscribe => {
                if let Err(e) = self.subscribe(&message.topic) {
                    warn!(session = %self.id, topic = %message.topic, error = %e, "subscribe failed");
                    self.send_error(&message.topic, e.to_string());
                }
            }
            ControlAction::Unsubscribe => {
                self.unsubscribe(&message.topic);
            }
        }
    }

    /// Subscribe this session to a topic key. Idempotent.
    pub fn subscribe(&mut self, key: &str) -> Result<(), CoreError> {
        let topic = Topic::parse(key)?;
        let canonical = topic.key();
        if self.subscriptions.contains_key(&canonical) {
            return Ok(());
        }

        let lease = self.registry.acquire(&topic)?;

        // Ack first, then let the broker deliver the retained frame, so
        // the client always sees connected → snapshot in that order.
        self.send(WireFrame {
            topic: canonical.clone(),
            payload: Payload::connected(),
        });
        let subscription = self.broker.subscribe(&topic, self.id, self.out_tx.clone());

        self.subscriptions.insert(
            canonical,
            ActiveTopic {
                _subscription: subscription,
                _lease: lease,
            },
        );
        Ok(())
    }

    /// Unsubscribe this session from a topic key.
    ///
    /// Delivery stops before this returns; the supervisor may keep
    /// running for other sessions.
    pub fn unsubscribe(&mut self, key: &str) -> bool {
        // Normalize so "jellyfin:sessions:jf-1" releases "jellyfin:jf-1".
        let canonical = Topic::parse(key).map_or_else(|_| key.to_owned(), |t| t.key());
        self.subscriptions.remove(&canonical).is_some()
    }

    fn send_error(&self, topic: &str, message: String) {
        // Network reason carries no _configError/_authError flags: these
        // are protocol-level errors, not upstream state.
        self.send(WireFrame {
            topic: topic.to_owned(),
            payload: Payload::error(DegradedReason::Network, message),
        });
    }

    fn send(&self, frame: WireFrame) {
        // A full queue here means the session is stuck; the socket writer
        // will notice the broker evicting it soon enough.
        let _ = self.out_tx.try_send(frame);
    }
}
