// Shared transport configuration for building reqwest::Client instances.
//
// Every adapter call goes through one client built from this config, so
// timeout and TLS policy are decided in a single place.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::AdapterError;

/// TLS verification mode.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (for self-signed, LAN-only servers).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
///
/// The timeout bounds every outbound adapter call; media-server APIs are
/// expected to answer well within it or be treated as unreachable.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("skydeck/0.1.0");

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path).map_err(|e| AdapterError::ConfigInvalid {
                    message: format!("failed to read CA cert: {e}"),
                })?;
                let cert = reqwest::Certificate::from_pem(&cert_pem).map_err(|e| {
                    AdapterError::ConfigInvalid {
                        message: format!("invalid CA cert: {e}"),
                    }
                })?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder.build().map_err(|e| AdapterError::ConfigInvalid {
            message: format!("failed to build HTTP client: {e}"),
        })
    }
}
