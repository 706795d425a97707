// Sonarr/Radarr adapter
//
// Both services share the v3 API shape and the `X-Api-Key` header; one
// strategy parameterized by kind covers them.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use secrecy::ExposeSecret;

use crate::adapter::{ApiRequest, ServiceAdapter};
use crate::error::AdapterError;
use crate::instance::{Credentials, ServiceInstance, ServiceKind, StreamKind};

pub struct ArrAdapter {
    kind: ServiceKind,
}

pub static SONARR: ArrAdapter = ArrAdapter {
    kind: ServiceKind::Sonarr,
};
pub static RADARR: ArrAdapter = ArrAdapter {
    kind: ServiceKind::Radarr,
};

#[async_trait]
impl ServiceAdapter for ArrAdapter {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn validate_config(&self, instance: &ServiceInstance) -> Result<(), AdapterError> {
        match &instance.credentials {
            Credentials::Token { token } if !token.expose_secret().is_empty() => Ok(()),
            Credentials::Token { .. } => Err(AdapterError::ConfigInvalid {
                message: "API key is empty".into(),
            }),
            _ => Err(AdapterError::ConfigInvalid {
                message: format!("{} requires an API key", self.kind),
            }),
        }
    }

    fn authorize(
        &self,
        instance: &ServiceInstance,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AdapterError> {
        let Credentials::Token { token } = &instance.credentials else {
            return Err(AdapterError::ConfigInvalid {
                message: format!("{} requires an API key", self.kind),
            });
        };
        Ok(request.header("X-Api-Key", token.expose_secret()))
    }

    fn stream_request(&self, stream: StreamKind) -> Option<ApiRequest> {
        match stream {
            StreamKind::Queue => {
                // Items without a matched series/movie would otherwise be
                // silently dropped from the queue view.
                let unknown_param = match self.kind {
                    ServiceKind::Radarr => "includeUnknownMovieItems",
                    _ => "includeUnknownSeriesItems",
                };
                Some(
                    ApiRequest::get("/api/v3/queue")
                        .with_query("pageSize", "50")
                        .with_query(unknown_param, "true"),
                )
            }
            StreamKind::Sessions | StreamKind::Library | StreamKind::Torrents => None,
        }
    }
}
