// Service adapter contract and the shared request executor.
//
// Each adapter is a stateless strategy object: it knows how to build
// authenticated requests for one service family and how to classify that
// service's failures. Everything protocol-agnostic (URL joining, timeout
// handling, envelope decoding) lives in `AdapterClient`.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::adapters;
use crate::error::AdapterError;
use crate::instance::{ServiceInstance, ServiceKind, StreamKind};
use crate::transport::TransportConfig;

/// An outbound request in service-relative form.
///
/// Adapters produce these from [`StreamKind`]s; callers can also build
/// them directly for one-off calls (connectivity tests, on-demand data).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the instance base URL, with a leading slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Per-service strategy: request construction, auth injection, failure
/// classification, and (where supported) the re-login routine.
///
/// Adapters are stateless and shared across all instances of their kind.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Check that the instance carries everything this adapter needs.
    ///
    /// Short-circuits execution with `ConfigInvalid` before a wasted
    /// round trip.
    fn validate_config(&self, instance: &ServiceInstance) -> Result<(), AdapterError>;

    /// Inject this service's auth scheme (header, query param, cookie)
    /// into an outbound request.
    fn authorize(
        &self,
        instance: &ServiceInstance,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AdapterError>;

    /// Map a non-success HTTP status to the error taxonomy.
    fn classify(&self, status: StatusCode, body: &str) -> AdapterError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::AuthFailed {
                message: format!("HTTP {status}"),
            },
            _ => AdapterError::Upstream {
                status: status.as_u16(),
                message: truncate_body(body),
            },
        }
    }

    /// The service's login endpoint path, if it has one.
    ///
    /// Used by the reauth coordinator's loop guard: an auth failure *on*
    /// this path never triggers a re-login.
    fn login_path(&self) -> Option<&'static str> {
        None
    }

    /// Run the service-specific re-login with the instance's long-lived
    /// credentials, returning a fresh short-lived token.
    async fn login(
        &self,
        _http: &reqwest::Client,
        _instance: &ServiceInstance,
    ) -> Result<SecretString, AdapterError> {
        Err(AdapterError::Unsupported("re-login"))
    }

    /// The request that fetches one snapshot stream, or `None` if this
    /// service does not serve that stream.
    fn stream_request(&self, stream: StreamKind) -> Option<ApiRequest>;

    /// WebSocket endpoint for push notifications, if the service
    /// supports push and the instance is ready to authenticate it.
    fn push_endpoint(&self, _instance: &ServiceInstance) -> Option<Url> {
        None
    }
}

/// Look up the adapter for a service kind.
pub fn adapter_for(kind: ServiceKind) -> &'static dyn ServiceAdapter {
    match kind {
        ServiceKind::Jellyfin => &adapters::jellyfin::JellyfinAdapter,
        ServiceKind::Plex => &adapters::plex::PlexAdapter,
        ServiceKind::Sonarr => &adapters::arr::SONARR,
        ServiceKind::Radarr => &adapters::arr::RADARR,
        ServiceKind::QBittorrent => &adapters::qbittorrent::QBittorrentAdapter,
    }
}

/// Shared request executor over one `reqwest::Client`.
///
/// Cheap to clone; all adapter calls for all instances go through the
/// same connection pool.
#[derive(Clone)]
pub struct AdapterClient {
    http: reqwest::Client,
}

impl AdapterClient {
    pub fn new(transport: &TransportConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            http: transport.build_client()?,
        })
    }

    /// The underlying HTTP client (for login flows that need direct access).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Execute a request against an instance through its adapter.
    ///
    /// Validates config, builds the URL, injects auth, sends, and either
    /// decodes the JSON body or returns the adapter's classification of
    /// the failure. An empty success body decodes to `Value::Null`.
    pub async fn execute(
        &self,
        instance: &ServiceInstance,
        request: &ApiRequest,
    ) -> Result<Value, AdapterError> {
        let adapter = adapter_for(instance.kind);

        if !instance.enabled {
            return Err(AdapterError::ConfigInvalid {
                message: format!("instance '{}' is disabled", instance.id),
            });
        }
        adapter.validate_config(instance)?;

        let url = join_url(&instance.base_url, &request.path)?;
        debug!(method = %request.method, %url, instance = %instance.id, "adapter request");

        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        let builder = adapter.authorize(instance, builder)?;

        let resp = builder
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        if !status.is_success() {
            return Err(adapter.classify(status, &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| AdapterError::Decode {
            message: e.to_string(),
            body: truncate_body(&body),
        })
    }
}

/// Join a service-relative path onto a base URL that may itself carry a
/// path prefix (reverse-proxy setups like `https://host/jellyfin`).
pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url, AdapterError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(AdapterError::InvalidUrl)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_owned()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
