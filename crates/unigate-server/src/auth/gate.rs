//! Connection authentication.
//!
//! The gate is a thin adapter over a [`CredentialVerifier`]: it never looks
//! inside tokens, it only maps the verifier's verdict onto the gateway's
//! error taxonomy, keeping expiry distinct from invalidity so clients can
//! run a refresh flow instead of failing hard.

use tracing::{debug, warn};
use unigate_core::{verify_token, AuthToken, GateError, GateResult, UserIdentity, Verification};

/// External token verifier.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &AuthToken) -> Verification;
}

/// Verifier for tokens issued by [`unigate_core::issue_token`].
pub struct HmacVerifier {
    secret: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl CredentialVerifier for HmacVerifier {
    fn verify(&self, token: &AuthToken) -> Verification {
        verify_token(&self.secret, token)
    }
}

/// Authenticates presented tokens.
pub struct AuthGate {
    verifier: Box<dyn CredentialVerifier>,
}

impl AuthGate {
    pub fn new(verifier: Box<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    /// Gate backed by the HMAC verifier with `secret`.
    pub fn hmac(secret: Vec<u8>) -> Self {
        Self::new(Box::new(HmacVerifier::new(secret)))
    }

    /// Resolve a token to the user it was issued for.
    pub fn authenticate(&self, token: &AuthToken) -> GateResult<UserIdentity> {
        match self.verifier.verify(token) {
            Verification::Valid { subject } => {
                debug!(user = %subject, "token accepted");
                Ok(subject)
            }
            Verification::Expired => {
                debug!("token expired");
                Err(GateError::AuthExpired)
            }
            Verification::Invalid(reason) => {
                warn!(reason = %reason, "token rejected");
                Err(GateError::AuthInvalid(reason))
            }
        }
    }
}
