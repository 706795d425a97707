use thiserror::Error;

/// Top-level error type for the `skydeck-api` crate.
///
/// Doubles as the failure classification every adapter produces:
/// the connection supervisor and the reauth coordinator branch on these
/// variants, never on raw transport errors or HTTP status codes.
#[derive(Debug, Error)]
pub enum AdapterError {
    // ── Authentication ──────────────────────────────────────────────
    /// Credential rejected by the service. Recoverable through re-login
    /// when the instance carries long-lived credentials.
    #[error("credential rejected: {message}")]
    AuthFailed { message: String },

    // ── Configuration ───────────────────────────────────────────────
    /// Required configuration is missing or malformed. Nothing to retry;
    /// the user has to fix the instance.
    #[error("integration misconfigured: {message}")]
    ConfigInvalid { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Network-level failure (refused, DNS, timeout). Recoverable via
    /// the supervisor's backoff loop.
    #[error("service unreachable: {reason}")]
    Unreachable { reason: String },

    /// Remote 4xx/5xx not covered by the variants above. Surfaced
    /// verbatim for operator diagnosis.
    #[error("upstream error (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    /// WebSocket push channel failed to connect or dropped.
    #[error("push channel failed: {0}")]
    PushConnect(String),

    // ── Data ────────────────────────────────────────────────────────
    /// Response body could not be decoded, with the raw body for debugging.
    #[error("response decode failed: {message}")]
    Decode { message: String, body: String },

    /// URL construction failed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Capability ──────────────────────────────────────────────────
    /// The adapter does not support this operation (e.g. re-login for
    /// API-key-only services).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl AdapterError {
    /// Returns `true` if the credential was rejected and a re-login
    /// might resolve it.
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }

    /// Returns `true` if this is a transient failure worth retrying
    /// with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::PushConnect(_))
    }

    /// Returns `true` if user action is required before another attempt
    /// makes sense.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigInvalid { .. })
    }

    /// Classify a `reqwest` transport error.
    ///
    /// Connection and timeout failures become [`Unreachable`](Self::Unreachable);
    /// anything else (a body read abort, a redirect loop) is surfaced as
    /// an upstream error with status 0.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Unreachable {
                reason: err.to_string(),
            }
        } else {
            Self::Upstream {
                status: err.status().map_or(0, |s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AdapterError;

    #[test]
    fn classification_helpers() {
        let auth = AdapterError::AuthFailed {
            message: "expired".into(),
        };
        assert!(auth.is_auth_failed());
        assert!(!auth.is_transient());

        let net = AdapterError::Unreachable {
            reason: "connection refused".into(),
        };
        assert!(net.is_transient());
        assert!(!net.is_auth_failed());

        let config = AdapterError::ConfigInvalid {
            message: "missing token".into(),
        };
        assert!(config.is_config());
        assert!(!config.is_transient());
    }
}
