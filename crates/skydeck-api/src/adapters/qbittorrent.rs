// qBittorrent adapter
//
// Auth: session cookie (`SID`) issued by the WebUI login endpoint in
// exchange for username/password. The WebUI answers 403 once the session
// expires, which routes through the reauth coordinator for a fresh SID.

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::adapter::{join_url, ApiRequest, ServiceAdapter};
use crate::error::AdapterError;
use crate::instance::{Credentials, ServiceInstance, ServiceKind, StreamKind};

const LOGIN_PATH: &str = "/api/v2/auth/login";

pub struct QBittorrentAdapter;

#[async_trait]
impl ServiceAdapter for QBittorrentAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::QBittorrent
    }

    fn validate_config(&self, instance: &ServiceInstance) -> Result<(), AdapterError> {
        match &instance.credentials {
            Credentials::UserSession { username, .. } if !username.is_empty() => Ok(()),
            Credentials::UserSession { .. } => Err(AdapterError::ConfigInvalid {
                message: "qbittorrent requires a username".into(),
            }),
            _ => Err(AdapterError::ConfigInvalid {
                message: "qbittorrent requires user credentials".into(),
            }),
        }
    }

    fn authorize(
        &self,
        instance: &ServiceInstance,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AdapterError> {
        // No SID yet: send unauthenticated, let the 403 drive the first login.
        Ok(match instance.credentials.session_token() {
            Some(sid) => request.header("Cookie", format!("SID={}", sid.expose_secret())),
            None => request,
        })
    }

    fn classify(&self, status: StatusCode, body: &str) -> AdapterError {
        // The WebUI uses 403 for both "not logged in" and "banned"; treat
        // both as auth failures so re-login gets a chance.
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            AdapterError::AuthFailed {
                message: format!("HTTP {status}: {}", body.trim()),
            }
        } else {
            AdapterError::Upstream {
                status: status.as_u16(),
                message: body.trim().to_owned(),
            }
        }
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
                "qbittorrent re-login requires user credentials",
            ));
        };

        let url = join_url(&instance.base_url, LOGIN_PATH)?;
        debug!(instance = %instance.id, "qbittorrent login");

        let resp = http
            .post(url)
            .form(&[
                ("username", username.as_str()),
                ("password", password.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::AuthFailed {
                message: format!("qbittorrent login failed (HTTP {status})"),
            });
        }

        let sid = extract_sid(resp.headers());
        let body = resp.text().await.unwrap_or_default();

        // A wrong password still returns 200, with "Fails." in the body
        // and no cookie.
        match sid {
            Some(sid) if body.trim() != "Fails." => Ok(sid),
            _ => Err(AdapterError::AuthFailed {
                message: "qbittorrent login rejected".into(),
            }),
        }
    }

    fn stream_request(&self, stream: StreamKind) -> Option<ApiRequest> {
        match stream {
            StreamKind::Torrents => {
                Some(ApiRequest::get("/api/v2/torrents/info").with_query("sort", "added_on"))
            }
            StreamKind::Sessions | StreamKind::Queue | StreamKind::Library => None,
        }
    }
}

/// Pull the `SID` value out of the login response's Set-Cookie headers.
fn extract_sid(headers: &reqwest::header::HeaderMap) -> Option<SecretString> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let rest = cookie.strip_prefix("SID=")?;
            let sid = rest.split(';').next()?.trim();
            if sid.is_empty() {
                None
            } else {
                Some(SecretString::from(sid.to_owned()))
            }
        })
}
