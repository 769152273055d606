//! Authentication and rate limiting.

pub mod gate;
pub mod rate_limit;

pub use gate::{AuthGate, CredentialVerifier, HmacVerifier};
pub use rate_limit::{CounterStore, MemoryCounterStore, RateDecision, RateLimiter, ServerRateLimits};
