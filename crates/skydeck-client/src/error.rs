use thiserror::Error;

/// Errors surfaced to dashboard widget bindings.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("access read failed: {0}")]
    Access(String),

    #[error("persisting widget config failed: {0}")]
    Persist(String),
}
