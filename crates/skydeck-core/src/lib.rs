// skydeck-core: connection supervision and realtime fan-out between
// skydeck-api and browser sessions.

pub mod broker;
pub mod debounce;
pub mod error;
pub mod frame;
pub mod registry;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod topic;

// ── Primary re-exports ──────────────────────────────────────────────
pub use broker::{Subscription, TopicBroker};
pub use debounce::Debouncer;
pub use error::CoreError;
pub use frame::{Payload, WireFrame};
pub use registry::{ConnectionRegistry, TopicLease};
pub use session::{ClientSession, ControlAction, ControlMessage, SESSION_QUEUE_CAPACITY};
pub use stream::StateStream;
pub use supervisor::{
    ConnectionState, DegradedReason, SnapshotSink, SupervisorConfig, SupervisorHandle,
    SupervisorTuning,
};
pub use topic::Topic;
