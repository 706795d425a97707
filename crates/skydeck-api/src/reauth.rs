// Reauth coordinator
//
// Wraps adapter execution with automatic credential recovery: an
// `AuthFailed` response triggers the service's re-login with the
// instance's long-lived credentials, persists the fresh token, signals
// the connection layer to rebuild, and retries the original request
// exactly once. Everything else passes through untouched.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapter::{adapter_for, AdapterClient, ApiRequest};
use crate::error::AdapterError;
use crate::instance::{InstanceId, ServiceInstance};
use crate::store::{ConnectionRefresher, InstanceStore};

/// Drives adapter requests with single-retry credential recovery.
///
/// Credential rotation follows a single-writer-per-instance discipline:
/// one re-login lock per instance serializes recovery, and a caller that
/// was waiting on the lock joins the finished re-login instead of
/// starting its own.
pub struct ReauthCoordinator {
    client: AdapterClient,
    store: Arc<dyn InstanceStore>,
    refresher: Option<Arc<dyn ConnectionRefresher>>,
    relogin_locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl ReauthCoordinator {
    pub fn new(client: AdapterClient, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            client,
            store,
            refresher: None,
            relogin_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the connection-rebuild capability.
    ///
    /// The rebuild signal is best-effort, so the coordinator works
    /// without one (e.g. for one-off CLI probes); attaching it lets live
    /// supervisors reopen their push channel with the fresh credential.
    pub fn with_refresher(mut self, refresher: Arc<dyn ConnectionRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// The underlying executor, for calls that must bypass recovery.
    pub fn client(&self) -> &AdapterClient {
        &self.client
    }

    /// Execute a request, recovering from a rejected credential at most
    /// once.
    ///
    /// The instance is reloaded from the store on every call so rotated
    /// credentials are picked up without caller involvement. On an
    /// unrecoverable path — re-login unsupported, re-login failed, or
    /// the retry failed too — the *original* error is returned.
    pub async fn request(
        &self,
        instance_id: &InstanceId,
        request: &ApiRequest,
    ) -> Result<serde_json::Value, AdapterError> {
        let instance = self.store.get_instance(instance_id).await?;

        let original_err = match self.client.execute(&instance, request).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !original_err.is_auth_failed() {
            return Err(original_err);
        }

        // Loop guard: an auth failure on the login endpoint itself can
        // only mean the long-lived credentials are wrong. Re-logging-in
        // would fail the same way forever.
        let adapter = adapter_for(instance.kind);
        if adapter
            .login_path()
            .is_some_and(|login| login == request.path)
        {
            debug!(instance = %instance.id, "auth failure on login endpoint, skipping reauth");
            return Err(original_err);
        }

        match self.relogin_and_retry(&instance, request).await {
            Ok(value) => Ok(value),
            Err(retry_err) => {
                warn!(
                    instance = %instance.id,
                    error = %retry_err,
                    "credential recovery failed"
                );
                Err(original_err)
            }
        }
    }

    /// Re-login under the per-instance lock, persist, signal, retry once.
    async fn relogin_and_retry(
        &self,
        failed: &ServiceInstance,
        request: &ApiRequest,
    ) -> Result<serde_json::Value, AdapterError> {
        let lock = self.relogin_lock(&failed.id).await;
        let _guard = lock.lock().await;

        // If a concurrent caller finished a re-login while we were
        // waiting on the lock, the stored token already changed -- join
        // that result rather than logging in again.
        let current = self.store.get_instance(&failed.id).await?;
        let refreshed = if current.credentials.same_session_token(&failed.credentials) {
            let adapter = adapter_for(current.kind);
            let token = adapter.login(self.client.http(), &current).await?;

            self.store.update_credential(&current.id, token.clone()).await?;
            debug!(instance = %current.id, "credential refreshed");

            if let Some(ref refresher) = self.refresher {
                refresher.rebuild(current.kind, &current.id);
            }

            current.with_session_token(token)
        } else {
            debug!(instance = %current.id, "joining concurrent credential refresh");
            current
        };

        self.client.execute(&refreshed, request).await
    }

    async fn relogin_lock(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.relogin_locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
