//! Session management: registry, lifecycle states, outbound replay queue.

pub mod outbox;
pub mod registry;
pub mod state;

pub use outbox::Outbox;
pub use registry::{
    Acquired, Binding, ControlRequest, Delivery, ReleaseReason, SessionInfo, SessionRegistry,
};
pub use state::ConnectionState;
