// skydeck-api: per-service protocol/auth translation for media-server
// integrations, plus the reauth coordinator that makes rotated
// credentials recover without user action.

pub mod adapter;
pub mod adapters;
pub mod error;
pub mod instance;
pub mod push;
pub mod reauth;
pub mod store;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use adapter::{adapter_for, AdapterClient, ApiRequest, ServiceAdapter};
pub use error::AdapterError;
pub use instance::{Credentials, InstanceId, ServiceInstance, ServiceKind, StreamKind};
pub use push::{spawn_push_feed, PushPulse, ReconnectConfig};
pub use reauth::ReauthCoordinator;
pub use store::{ConnectionRefresher, InstanceStore, MemoryInstanceStore};
pub use transport::{TlsMode, TransportConfig};
