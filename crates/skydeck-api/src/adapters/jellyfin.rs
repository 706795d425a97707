// Jellyfin adapter
//
// Auth: short-lived access token in the `X-Emby-Token` header, obtained
// by logging in with username/password. Tokens are invalidated whenever
// the user's sessions are revoked, so this is the adapter that exercises
// the reauth path most.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::adapter::{join_url, ApiRequest, ServiceAdapter};
use crate::error::AdapterError;
use crate::instance::{Credentials, ServiceInstance, ServiceKind, StreamKind};

const LOGIN_PATH: &str = "/Users/AuthenticateByName";

/// Client identification Jellyfin requires on the login endpoint.
const AUTH_HEADER: &str = "MediaBrowser Client=\"Skydeck\", Device=\"skydeck\", \
                           DeviceId=\"skydeck\", Version=\"0.1.0\"";

pub struct JellyfinAdapter;

#[async_trait]
impl ServiceAdapter for JellyfinAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Jellyfin
    }

    fn validate_config(&self, instance: &ServiceInstance) -> Result<(), AdapterError> {
        match &instance.credentials {
            Credentials::Token { .. } => Ok(()),
            Credentials::UserSession { username, .. } => {
                if username.is_empty() {
                    Err(AdapterError::ConfigInvalid {
                        message: "jellyfin user session requires a username".into(),
                    })
                } else {
                    Ok(())
                }
            }
            Credentials::QueryToken { .. } => Err(AdapterError::ConfigInvalid {
                message: "jellyfin does not accept query-string tokens".into(),
            }),
        }
    }

    fn authorize(
        &self,
        instance: &ServiceInstance,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AdapterError> {
        // A user-session instance with no token yet goes out unauthenticated;
        // the resulting 401 routes through the reauth coordinator, which
        // performs the first login.
        Ok(match access_token(instance) {
            Some(token) => request.header("X-Emby-Token", token.expose_secret()),
            None => request,
        })
    }

    fn login_path(&self) -> Option<&'static str> {
        Some(LOGIN_PATH)
    }

    async fn login(
        &self,
        http: &reqwest::Client,
        instance: &ServiceInstance,
    ) -> Result<SecretString, AdapterError> {
        let Credentials::UserSession {
            username, password, ..
        } = &instance.credentials
        else {
            return Err(AdapterError::Unsupported(
                "jellyfin re-login requires user credentials",
            ));
        };

        let url = join_url(&instance.base_url, LOGIN_PATH)?;
        debug!(instance = %instance.id, "jellyfin login");

        let resp = http
            .post(url)
            .header("X-Emby-Authorization", AUTH_HEADER)
            .json(&json!({
                "Username": username,
                "Pw": password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::AuthFailed {
                message: format!("jellyfin login failed (HTTP {status})"),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;
        body["AccessToken"]
            .as_str()
            .map(|t| SecretString::from(t.to_owned()))
            .ok_or_else(|| AdapterError::Decode {
                message: "login response missing AccessToken".into(),
                body: String::new(),
            })
    }

    fn stream_request(&self, stream: StreamKind) -> Option<ApiRequest> {
        match stream {
            StreamKind::Sessions => Some(ApiRequest::get("/Sessions").with_query("activeWithinSeconds", "960")),
            StreamKind::Library => Some(ApiRequest::get("/Items/Counts")),
            StreamKind::Queue | StreamKind::Torrents => None,
        }
    }

    fn push_endpoint(&self, instance: &ServiceInstance) -> Option<Url> {
        // Session-change notifications arrive on the server's socket
        // endpoint; requires an already-issued token.
        let token = access_token(instance)?;
        let mut url = join_url(&instance.base_url, "/socket").ok()?;
        match url.scheme() {
            "http" => url.set_scheme("ws").ok()?,
            "https" => url.set_scheme("wss").ok()?,
            _ => return None,
        }
        url.query_pairs_mut()
            .append_pair("api_key", token.expose_secret())
            .append_pair("deviceId", "skydeck");
        Some(url)
    }
}

/// The token to authenticate requests with, whichever credential form
/// carries it.
fn access_token(instance: &ServiceInstance) -> Option<&SecretString> {
    match &instance.credentials {
        Credentials::Token { token } => Some(token),
        Credentials::UserSession { token, .. } => token.as_ref(),
        Credentials::QueryToken { .. } => None,
    }
}
