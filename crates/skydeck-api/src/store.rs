// Seams to the configuration store and the connection layer.
//
// The store owns instance definitions; this crate only reads them, and
// writes exactly one field: the short-lived credential rotated by the
// reauth coordinator.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::AdapterError;
use crate::instance::{InstanceId, ServiceInstance, ServiceKind};

/// Read/write access to configured instances.
///
/// Implemented by the configuration crate (file-backed) and by
/// [`MemoryInstanceStore`] for embedding and tests.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, id: &InstanceId) -> Result<ServiceInstance, AdapterError>;

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, AdapterError>;

    /// Persist a rotated short-lived credential for an instance.
    async fn update_credential(
        &self,
        id: &InstanceId,
        token: SecretString,
    ) -> Result<(), AdapterError>;
}

/// Capability to rebuild an instance's live connection after its
/// credential changed.
///
/// Injected into the reauth coordinator explicitly — never resolved from
/// ambient state — so tests can observe the signal with a fake. The
/// signal is best-effort: implementations must not fail the caller.
pub trait ConnectionRefresher: Send + Sync {
    fn rebuild(&self, kind: ServiceKind, instance_id: &InstanceId);
}

/// In-memory instance store.
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, ServiceInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, instance: ServiceInstance) {
        if let Ok(mut map) = self.instances.write() {
            map.insert(instance.id.clone(), instance);
        }
    }

    pub fn remove(&self, id: &InstanceId) {
        if let Ok(mut map) = self.instances.write() {
            map.remove(id);
        }
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get_instance(&self, id: &InstanceId) -> Result<ServiceInstance, AdapterError> {
        self.instances
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned())
            .ok_or_else(|| AdapterError::ConfigInvalid {
                message: format!("unknown instance '{id}'"),
            })
    }

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, AdapterError> {
        Ok(self
            .instances
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_credential(
        &self,
        id: &InstanceId,
        token: SecretString,
    ) -> Result<(), AdapterError> {
        let mut map = self.instances.write().map_err(|_| AdapterError::ConfigInvalid {
            message: "instance store poisoned".into(),
        })?;
        let instance = map.get_mut(id).ok_or_else(|| AdapterError::ConfigInvalid {
            message: format!("unknown instance '{id}'"),
        })?;
        instance.credentials = instance.credentials.clone().with_session_token(token);
        Ok(())
    }
}
