// Credential cipher seam.
//
// The layer consumes encrypt/decrypt as an opaque pair; the scheme
// behind them is not its business. The keyring implementation keeps
// secret material in the OS secret service and leaves only an opaque
// reference in the config file.

use secrecy::{ExposeSecret, SecretString};

use crate::ConfigError;

const KEYRING_PREFIX: &str = "keyring:";

/// Opaque encrypt/decrypt pair for credential fields.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String, ConfigError>;
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, ConfigError>;
}

/// Identity cipher: stores secrets as-is.
///
/// For tests and for deployments where the config file itself is the
/// trust boundary (e.g. an encrypted volume).
pub struct PlainCipher;

impl CredentialCipher for PlainCipher {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String, ConfigError> {
        Ok(plaintext.expose_secret().to_owned())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, ConfigError> {
        Ok(SecretString::from(ciphertext.to_owned()))
    }
}

/// OS-keyring-backed cipher.
///
/// `encrypt` stores the secret under a fresh entry and returns a
/// `keyring:<id>` reference; `decrypt` resolves the reference. A value
/// without the prefix is treated as plaintext, so hand-written config
/// files keep working and get migrated on the next credential rotation.
pub struct KeyringCipher {
    service: String,
}

impl KeyringCipher {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl CredentialCipher for KeyringCipher {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String, ConfigError> {
        let id = uuid::Uuid::new_v4().to_string();
        let entry =
            keyring::Entry::new(&self.service, &id).map_err(|e| ConfigError::Credential {
                message: e.to_string(),
            })?;
        entry
            .set_password(plaintext.expose_secret())
            .map_err(|e| ConfigError::Credential {
                message: e.to_string(),
            })?;
        Ok(format!("{KEYRING_PREFIX}{id}"))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, ConfigError> {
        let Some(id) = ciphertext.strip_prefix(KEYRING_PREFIX) else {
            return Ok(SecretString::from(ciphertext.to_owned()));
        };
        let entry =
            keyring::Entry::new(&self.service, id).map_err(|e| ConfigError::Credential {
                message: e.to_string(),
            })?;
        let secret = entry.get_password().map_err(|e| ConfigError::Credential {
            message: format!("keyring entry '{id}' unavailable: {e}"),
        })?;
        Ok(SecretString::from(secret))
    }
}
