//! HMAC-signed bearer tokens.
//!
//! Format: `hex(user_id).expiry_secs.hex(HMAC-SHA256(secret, expiry_be8 || user_id))`
//!
//! Verification checks the signature before the expiry, so a forged token is
//! always reported as invalid even when its claimed expiry has passed.

use crate::identity::UserIdentity;
use ring::hmac;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque bearer credential presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl From<&str> for AuthToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AuthToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Outcome of checking a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid { subject: UserIdentity },
    Expired,
    Invalid(String),
}

/// Issue a token for `user` valid for `ttl_secs` from now.
pub fn issue_token(secret: &[u8], user: &UserIdentity, ttl_secs: u64) -> AuthToken {
    issue_token_expiring_at(secret, user, now_secs().saturating_add(ttl_secs))
}

/// Issue a token with an absolute expiry (epoch seconds).
pub fn issue_token_expiring_at(secret: &[u8], user: &UserIdentity, expiry: u64) -> AuthToken {
    let tag = sign(secret, user.as_str(), expiry);
    AuthToken(format!(
        "{}.{}.{}",
        hex::encode(user.as_str()),
        expiry,
        hex::encode(tag.as_ref())
    ))
}

/// Verify a token against the server secret.
pub fn verify_token(secret: &[u8], token: &AuthToken) -> Verification {
    let mut parts = token.as_str().splitn(3, '.');
    let (Some(user_hex), Some(expiry_str), Some(tag_hex)) = (parts.next(), parts.next(), parts.next())
    else {
        return Verification::Invalid("malformed token".into());
    };

    let user = match hex::decode(user_hex).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(u) if !u.is_empty() => u,
        _ => return Verification::Invalid("malformed subject".into()),
    };
    let Ok(expiry) = expiry_str.parse::<u64>() else {
        return Verification::Invalid("malformed expiry".into());
    };
    let Ok(tag) = hex::decode(tag_hex) else {
        return Verification::Invalid("malformed signature".into());
    };

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    if hmac::verify(&key, &signed_data(&user, expiry), &tag).is_err() {
        return Verification::Invalid("invalid token signature".into());
    }

    if now_secs() >= expiry {
        return Verification::Expired;
    }

    Verification::Valid {
        subject: UserIdentity::new(user),
    }
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

fn sign(secret: &[u8], user: &str, expiry: u64) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, &signed_data(user, expiry))
}

fn signed_data(user: &str, expiry: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + user.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user.as_bytes());
    data
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
