//! Shared configuration for the skydeck daemon.
//!
//! TOML instance definitions (figment: file + `SKYDECK_` env overrides),
//! credential resolution through an opaque cipher seam, and the
//! file-backed [`InstanceStore`](skydeck_api::InstanceStore) the
//! realtime layer consumes.

mod cipher;
mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skydeck_api::ServiceKind;
use skydeck_core::SupervisorConfig;

pub use cipher::{CredentialCipher, KeyringCipher, PlainCipher};
pub use store::FileInstanceStore;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no instance named '{id}'")]
    UnknownInstance { id: String },

    #[error("credential handling failed: {message}")]
    Credential { message: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Layer-wide defaults, overridable per instance.
    #[serde(default)]
    pub defaults: Defaults,

    /// Configured integration instances, keyed by instance id.
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the browser-stream endpoint binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8150".into()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Outbound request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Accept self-signed upstream certificates.
    #[serde(default)]
    pub insecure_tls: bool,

    /// Debounce window for push-notification bursts, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Reconciliation fetch cadence, in seconds.
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            insecure_tls: false,
            debounce_ms: default_debounce_ms(),
            reconcile_secs: default_reconcile_secs(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_reconcile_secs() -> u64 {
    30
}

/// One configured instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub kind: ServiceKind,

    /// Display name; falls back to the instance id.
    pub name: Option<String>,

    /// Service root URL, e.g. `https://jellyfin.local:8096`.
    pub url: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub credentials: CredentialConfig,

    /// Per-instance supervisor timing overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorOverrides>,
}

fn default_enabled() -> bool {
    true
}

/// Credential fields as stored on disk. Secret-bearing fields hold
/// ciphertext produced by the configured [`CredentialCipher`]; this
/// crate never writes plaintext secrets to the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialConfig {
    /// Static API token sent as a header.
    Token { token: String },
    /// Static API token sent as a query parameter.
    QueryToken { token: String },
    /// Username/password with a rotating session token.
    UserSession {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupervisorOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_secs: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file layered under `SKYDECK_`
    /// environment overrides (`SKYDECK_SERVER__LISTEN`, ...).
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SKYDECK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (id, instance) in &self.instances {
            if id.is_empty() || id.contains(':') {
                return Err(ConfigError::Validation {
                    field: format!("instances.{id}"),
                    reason: "instance ids must be non-empty and must not contain ':'".into(),
                });
            }
            url::Url::parse(&instance.url).map_err(|e| ConfigError::Validation {
                field: format!("instances.{id}.url"),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Supervisor timings for one instance: layer defaults overlaid
    /// with the instance's overrides.
    pub fn supervisor_config(&self, id: &str) -> SupervisorConfig {
        let base = SupervisorConfig {
            debounce: Duration::from_millis(self.defaults.debounce_ms),
            reconcile_interval: Duration::from_secs(self.defaults.reconcile_secs),
            ..SupervisorConfig::default()
        };
        let Some(overrides) = self
            .instances
            .get(id)
            .and_then(|i| i.supervisor.as_ref())
        else {
            return base;
        };
        SupervisorConfig {
            debounce: overrides
                .debounce_ms
                .map_or(base.debounce, Duration::from_millis),
            reconcile_interval: overrides
                .reconcile_secs
                .map_or(base.reconcile_interval, Duration::from_secs),
            ..base
        }
    }
}

/// Default config file location (`~/.config/skydeck/config.toml` on
/// Linux, platform-appropriate elsewhere).
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "skydeck").map(|dirs| dirs.config_dir().join("config.toml"))
}
