// Integration instance model shared by every API surface.
//
// Instances are owned by the configuration store; this crate treats them
// as read-only input except for the short-lived credential field, which
// the reauth coordinator rotates after a successful re-login.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

/// Identifier of a configured integration instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kind of media service an instance talks to.
///
/// Determines which adapter handles requests and which snapshot streams
/// the instance can serve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Jellyfin,
    Plex,
    Sonarr,
    Radarr,
    QBittorrent,
}

impl ServiceKind {
    /// The snapshot streams this service can serve.
    pub fn supported_streams(self) -> &'static [StreamKind] {
        match self {
            Self::Jellyfin | Self::Plex => &[StreamKind::Sessions, StreamKind::Library],
            Self::Sonarr | Self::Radarr => &[StreamKind::Queue],
            Self::QBittorrent => &[StreamKind::Torrents],
        }
    }

    /// The stream used when a topic omits the subtype.
    pub fn default_stream(self) -> StreamKind {
        match self {
            Self::Jellyfin | Self::Plex => StreamKind::Sessions,
            Self::Sonarr | Self::Radarr => StreamKind::Queue,
            Self::QBittorrent => StreamKind::Torrents,
        }
    }
}

/// A logical snapshot stream within a service (the topic subtype).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Active playback sessions (Jellyfin, Plex).
    Sessions,
    /// Download/activity queue (Sonarr, Radarr).
    Queue,
    /// Library statistics.
    Library,
    /// Torrent transfer list (qBittorrent).
    Torrents,
}

/// Credentials for authenticating with a service instance.
///
/// The three observed auth shapes: a token injected as a header, a token
/// injected as a query parameter, and a username/password pair that
/// yields a rotating short-lived session token.
#[derive(Clone)]
pub enum Credentials {
    /// Static API token sent as a request header.
    Token { token: SecretString },

    /// Static API token sent as a query-string parameter.
    QueryToken { token: SecretString },

    /// Long-lived username/password plus the current short-lived session
    /// token (absent until the first login). Only this form is
    /// recoverable through re-login.
    UserSession {
        username: String,
        password: SecretString,
        token: Option<SecretString>,
    },
}

impl Credentials {
    /// The short-lived session token, if this credential form carries one.
    pub fn session_token(&self) -> Option<&SecretString> {
        match self {
            Self::UserSession { token, .. } => token.as_ref(),
            Self::Token { .. } | Self::QueryToken { .. } => None,
        }
    }

    /// Replace the short-lived token, keeping long-lived material intact.
    ///
    /// For static-token forms this swaps the token itself.
    pub fn with_session_token(self, new_token: SecretString) -> Self {
        match self {
            Self::UserSession {
                username, password, ..
            } => Self::UserSession {
                username,
                password,
                token: Some(new_token),
            },
            Self::Token { .. } => Self::Token { token: new_token },
            Self::QueryToken { .. } => Self::QueryToken { token: new_token },
        }
    }

    /// Whether two credentials carry the same session token.
    ///
    /// Used by the reauth coordinator to detect that a concurrent caller
    /// already completed a re-login.
    pub fn same_session_token(&self, other: &Self) -> bool {
        match (self.session_token(), other.session_token()) {
            (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
            (None, None) => true,
            _ => false,
        }
    }
}

// Manual Debug: secret material must never leak through logging.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { .. } => f.write_str("Credentials::Token(<redacted>)"),
            Self::QueryToken { .. } => f.write_str("Credentials::QueryToken(<redacted>)"),
            Self::UserSession {
                username, token, ..
            } => f
                .debug_struct("Credentials::UserSession")
                .field("username", username)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish_non_exhaustive(),
        }
    }
}

/// A configured integration instance.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub kind: ServiceKind,
    /// Display name shown in the dashboard.
    pub name: String,
    /// Service root URL, e.g. `https://jellyfin.local:8096`.
    pub base_url: Url,
    pub credentials: Credentials,
    pub enabled: bool,
}

impl ServiceInstance {
    /// Copy of this instance with a refreshed session token.
    pub fn with_session_token(mut self, token: SecretString) -> Self {
        self.credentials = self.credentials.with_session_token(token);
        self
    }
}
