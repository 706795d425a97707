// Plex adapter
//
// Auth: static token in the `X-Plex-Token` query parameter. Plex answers
// in XML unless asked otherwise, so every request pins the Accept header.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use secrecy::ExposeSecret;

use crate::adapter::{ApiRequest, ServiceAdapter};
use crate::error::AdapterError;
use crate::instance::{Credentials, ServiceInstance, ServiceKind, StreamKind};

pub struct PlexAdapter;

#[async_trait]
impl ServiceAdapter for PlexAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Plex
    }

    fn validate_config(&self, instance: &ServiceInstance) -> Result<(), AdapterError> {
        match &instance.credentials {
            Credentials::Token { .. } | Credentials::QueryToken { .. } => Ok(()),
            Credentials::UserSession { .. } => Err(AdapterError::ConfigInvalid {
                message: "plex requires a static token, not user credentials".into(),
            }),
        }
    }

    fn authorize(
        &self,
        instance: &ServiceInstance,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AdapterError> {
        let token = match &instance.credentials {
            Credentials::Token { token } | Credentials::QueryToken { token } => token,
            Credentials::UserSession { .. } => {
                return Err(AdapterError::ConfigInvalid {
                    message: "plex requires a static token".into(),
                });
            }
        };
        Ok(request
            .query(&[("X-Plex-Token", token.expose_secret())])
            .header("Accept", "application/json"))
    }

    fn stream_request(&self, stream: StreamKind) -> Option<ApiRequest> {
        match stream {
            StreamKind::Sessions => Some(ApiRequest::get("/status/sessions")),
            StreamKind::Library => Some(ApiRequest::get("/library/sections")),
            StreamKind::Queue | StreamKind::Torrents => None,
        }
    }
}
