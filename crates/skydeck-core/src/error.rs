// ── Core error types ──
//
// Consumer-facing errors from skydeck-core. Adapter-level classification
// stays available through the wrapped variant; everything else here is
// about the realtime layer itself.

use skydeck_api::AdapterError;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A topic key could not be parsed or names an unsupported stream.
    #[error("invalid topic '{key}': {reason}")]
    InvalidTopic { key: String, reason: String },

    /// The registry was used before its reauth coordinator was attached.
    #[error("integration layer not wired: {0}")]
    NotWired(&'static str),

    /// Failure from the adapter layer, classification preserved.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("internal error: {0}")]
    Internal(String),
}
