// Access-control seam.
//
// Which instances the current viewer may use is decided elsewhere; this
// layer only consumes the answer and distinguishes a definitive read
// from a transient failure -- the distinction the stability rule in the
// resolver depends on.

use async_trait::async_trait;

use skydeck_api::{InstanceId, ServiceKind};

use crate::error::ClientError;

/// A viewer-visible instance, as returned by access control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: InstanceId,
    pub kind: ServiceKind,
    pub name: String,
}

/// Access-control collaborator: the set of instances a viewer may use.
///
/// Re-queried when a permissions-changed signal arrives from outside
/// this layer.
#[async_trait]
pub trait AccessProvider: Send + Sync {
    async fn accessible_instances(&self, viewer_id: &str) -> Result<Vec<InstanceRef>, ClientError>;
}

/// One observation of the accessible set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRead {
    /// No read has completed yet.
    Loading,
    /// The read failed transiently (network blip, refresh in flight).
    /// Must not overwrite a previously-stable resolution.
    Failed,
    /// A definitive read.
    Ready(Vec<InstanceRef>),
}
