// File-backed instance store.
//
// Implements the `InstanceStore` seam the realtime layer consumes:
// reads resolve ciphertext credentials through the cipher, and the one
// write path -- credential rotation by the reauth coordinator --
// re-encrypts and persists atomically (write-to-temp + rename).

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;
use url::Url;

use skydeck_api::{
    AdapterError, Credentials, InstanceId, InstanceStore, ServiceInstance,
};

use crate::{cipher::CredentialCipher, Config, ConfigError, CredentialConfig};

/// Instance store backed by the TOML config file.
pub struct FileInstanceStore {
    path: PathBuf,
    cipher: Arc<dyn CredentialCipher>,
    config: RwLock<Config>,
}

impl FileInstanceStore {
    /// Load the config file and wrap it as an instance store.
    pub fn open(path: PathBuf, cipher: Arc<dyn CredentialCipher>) -> Result<Self, ConfigError> {
        let config = Config::load(&path)?;
        Ok(Self {
            path,
            cipher,
            config: RwLock::new(config),
        })
    }

    /// Supervisor timings for one instance (defaults + overrides).
    pub fn supervisor_config(&self, id: &InstanceId) -> skydeck_core::SupervisorConfig {
        self.read(|config| config.supervisor_config(id.as_str()))
    }

    /// Outbound transport settings from the config defaults.
    pub fn transport_config(&self) -> skydeck_api::TransportConfig {
        self.read(|config| skydeck_api::TransportConfig {
            tls: if config.defaults.insecure_tls {
                skydeck_api::TlsMode::DangerAcceptInvalid
            } else {
                skydeck_api::TlsMode::System
            },
            timeout: std::time::Duration::from_secs(config.defaults.timeout_secs),
        })
    }

    /// Address the browser-stream endpoint binds to.
    pub fn listen_addr(&self) -> String {
        self.read(|config| config.server.listen.clone())
    }

    fn read<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        match self.config.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn resolve(&self, id: &str) -> Result<ServiceInstance, ConfigError> {
        self.read(|config| {
            let instance = config
                .instances
                .get(id)
                .ok_or_else(|| ConfigError::UnknownInstance { id: id.to_owned() })?;

            let base_url = Url::parse(&instance.url).map_err(|e| ConfigError::Validation {
                field: format!("instances.{id}.url"),
                reason: e.to_string(),
            })?;

            let credentials = match &instance.credentials {
                CredentialConfig::Token { token } => Credentials::Token {
                    token: self.cipher.decrypt(token)?,
                },
                CredentialConfig::QueryToken { token } => Credentials::QueryToken {
                    token: self.cipher.decrypt(token)?,
                },
                CredentialConfig::UserSession {
                    username,
                    password,
                    token,
                } => Credentials::UserSession {
                    username: username.clone(),
                    password: self.cipher.decrypt(password)?,
                    token: token
                        .as_deref()
                        .map(|t| self.cipher.decrypt(t))
                        .transpose()?,
                },
            };

            Ok(ServiceInstance {
                id: id.into(),
                kind: instance.kind,
                name: instance.name.clone().unwrap_or_else(|| id.to_owned()),
                base_url,
                credentials,
                enabled: instance.enabled,
            })
        })
    }

    /// Serialize and persist the current config atomically.
    fn save(&self) -> Result<(), ConfigError> {
        let rendered = self.read(toml::to_string_pretty)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "config persisted");
        Ok(())
    }
}

// The registry consults this at supervisor spawn time, so per-instance
// overrides in the file take effect on the next (re)spawn.
impl skydeck_core::SupervisorTuning for FileInstanceStore {
    fn supervisor_config(
        &self,
        _kind: skydeck_api::ServiceKind,
        instance_id: &InstanceId,
    ) -> skydeck_core::SupervisorConfig {
        FileInstanceStore::supervisor_config(self, instance_id)
    }
}

fn config_err(err: ConfigError) -> AdapterError {
    match err {
        ConfigError::UnknownInstance { id } => AdapterError::ConfigInvalid {
            message: format!("unknown instance '{id}'"),
        },
        other => AdapterError::ConfigInvalid {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn get_instance(&self, id: &InstanceId) -> Result<ServiceInstance, AdapterError> {
        self.resolve(id.as_str()).map_err(config_err)
    }

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, AdapterError> {
        let ids: Vec<String> = self.read(|config| config.instances.keys().cloned().collect());
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            instances.push(self.resolve(&id).map_err(config_err)?);
        }
        Ok(instances)
    }

    async fn update_credential(
        &self,
        id: &InstanceId,
        token: SecretString,
    ) -> Result<(), AdapterError> {
        let ciphertext = self.cipher.encrypt(&token).map_err(config_err)?;

        {
            let mut config = match self.config.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let instance = config
                .instances
                .get_mut(id.as_str())
                .ok_or_else(|| AdapterError::ConfigInvalid {
                    message: format!("unknown instance '{id}'"),
                })?;

            match &mut instance.credentials {
                CredentialConfig::Token { token }
                | CredentialConfig::QueryToken { token } => *token = ciphertext,
                CredentialConfig::UserSession { token, .. } => *token = Some(ciphertext),
            }
        }

        self.save().map_err(config_err)
    }
}
