// skydeck-client: client-side instance resolution and subscription
// binding for dashboard widgets.
//
// A widget knows a configured instance id; what it can actually use
// depends on what the viewer may access right now. This crate decides
// the effective binding (with flicker-free stability across transient
// failures), persists durable fallbacks, and keeps the widget's
// subscription set in sync with the decision.

pub mod access;
pub mod error;
pub mod resolve;
pub mod resolver;
pub mod subscriptions;

// ── Primary re-exports ──────────────────────────────────────────────
pub use access::{AccessProvider, AccessRead, InstanceRef};
pub use error::ClientError;
pub use resolve::{resolve, FallbackDecision, FallbackReason};
pub use resolver::{InstanceResolver, WidgetConfigStore};
pub use subscriptions::{
    BrokerTransport, SubscribeTransport, SubscriptionHandle, SubscriptionSet,
};
