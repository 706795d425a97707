// Broadcast envelope for the browser wire contract.
//
// Three payload shapes reach subscribers: a data snapshot, a synthetic
// error frame carrying the degraded-reason flags, and a `connected`
// control frame. Field names are part of the wire contract consumed by
// dashboard widgets -- renames here are breaking changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::supervisor::DegradedReason;

/// One frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Synthetic error broadcast, shaped by the degraded reason so
    /// widgets can distinguish "bad credentials" from "unreachable"
    /// without polling anything.
    Error {
        #[serde(rename = "_error")]
        error: bool,
        #[serde(rename = "_message")]
        message: String,
        #[serde(rename = "_configError", skip_serializing_if = "Option::is_none")]
        config_error: Option<bool>,
        #[serde(rename = "_authError", skip_serializing_if = "Option::is_none")]
        auth_error: Option<bool>,
    },

    /// Control frame announcing the upstream channel is live.
    Connected {
        #[serde(rename = "type")]
        control: ConnectedTag,
    },

    /// The latest normalized snapshot for the topic.
    Data { data: Value },
}

/// Marker for the `connected` control frame (`"type": "connected"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectedTag {
    Connected,
}

impl Payload {
    pub fn data(value: Value) -> Self {
        Self::Data { data: value }
    }

    pub fn error(reason: DegradedReason, message: impl Into<String>) -> Self {
        Self::Error {
            error: true,
            message: message.into(),
            config_error: (reason == DegradedReason::Config).then_some(true),
            auth_error: (reason == DegradedReason::Auth).then_some(true),
        }
    }

    pub fn connected() -> Self {
        Self::Connected {
            control: ConnectedTag::Connected,
        }
    }

    /// Whether this payload is kept as the topic's last value for
    /// late-joining subscribers. Control frames are not.
    pub fn is_retained(&self) -> bool {
        !matches!(self, Self::Connected { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A routed frame as delivered to a browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub topic: String,
    pub payload: Payload,
}
