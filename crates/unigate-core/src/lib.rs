//! unigate-core: shared protocol library for the unigate real-time gateway.
//!
//! Provides the JSON envelope and its size-enforcing codec, user and
//! connection identifiers, HMAC bearer tokens, the error taxonomy and the
//! abstract transport trait.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, MAX_ENVELOPE_SIZE};
pub use envelope::{kind, now_millis, Envelope};
pub use error::{ErrorCode, GateError, GateResult};
pub use identity::{ConnectionId, UserIdentity};
pub use token::{generate_secret, issue_token, verify_token, AuthToken, Verification};
pub use transport::{close_code, Transport, TransportFuture};
