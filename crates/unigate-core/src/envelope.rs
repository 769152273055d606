//! The generic `{type, data, timestamp}` wire message.
//!
//! Application payloads are opaque to the gateway. Besides `data`, any extra
//! top-level fields a client sends (`client_id`, `msg_num`, ...) are carried
//! through untouched so routers see exactly what the client wrote.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Envelope types the gateway itself produces or consumes.
pub mod kind {
    /// Client → server: credential presented in-band when the handshake had none.
    pub const AUTH: &str = "AUTH";
    pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
    pub const AUTH_FAILURE: &str = "AUTH_FAILURE";
    pub const ERROR: &str = "ERROR";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const ECHO: &str = "ECHO";
}

/// Top-level keys owned by the envelope itself; never valid in `extra`.
pub const RESERVED_FIELDS: [&str; 3] = ["type", "data", "timestamp"];

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Epoch milliseconds; assigned by the server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
            timestamp: Some(now_millis()),
            extra: Map::new(),
        }
    }

    /// Attach an extra top-level field. Reserved keys are ignored; set
    /// `kind`, `data` or `timestamp` directly instead.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !is_reserved(&key) {
            self.extra.insert(key, value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Fill in the timestamp if the sender left it out.
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now_millis());
        }
    }

    /// `ERROR` envelope carrying a per-message or connection-level reason.
    pub fn error(code: ErrorCode, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut data = json!({
            "code": code,
            "error": message.into(),
        });
        if let Some(retry) = retry_after {
            data["retry_after_ms"] = json!(retry.as_millis() as u64);
        }
        Self::new(kind::ERROR, data)
    }

    /// Reason code of an `ERROR` / `AUTH_FAILURE` envelope.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if !self.is(kind::ERROR) && !self.is(kind::AUTH_FAILURE) {
            return None;
        }
        self.data
            .get("code")
            .and_then(|c| serde_json::from_value(c.clone()).ok())
    }

    /// `retry_after_ms` of a `RATE_LIMITED` error.
    pub fn retry_after(&self) -> Option<Duration> {
        self.data
            .get("retry_after_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

pub(crate) fn is_reserved(key: &str) -> bool {
    RESERVED_FIELDS.contains(&key)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_stamped() {
        let env = Envelope::new("TEST", "hello");
        assert!(env.timestamp.is_some());
        assert_eq!(env.data, json!("hello"));
    }

    #[test]
    fn stamp_keeps_existing_timestamp() {
        let mut env = Envelope::new("TEST", Value::Null);
        env.timestamp = Some(1_234_567_890);
        env.stamp();
        assert_eq!(env.timestamp, Some(1_234_567_890));
    }

    #[test]
    fn error_envelope_exposes_code_and_retry() {
        let env = Envelope::error(
            ErrorCode::RateLimited,
            "slow down",
            Some(Duration::from_millis(1500)),
        );
        assert!(env.is(kind::ERROR));
        assert_eq!(env.error_code(), Some(ErrorCode::RateLimited));
        assert_eq!(env.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn with_field_ignores_reserved_keys() {
        let env = Envelope::new("TEST", "d")
            .with_field("type", "OTHER")
            .with_field("timestamp", 1)
            .with_field("client_id", 4);
        assert_eq!(env.kind, "TEST");
        assert_eq!(env.field("type"), None);
        assert_eq!(env.field("client_id"), Some(&json!(4)));
        assert_eq!(env.extra.len(), 1);
    }

    #[test]
    fn error_code_only_on_error_kinds() {
        let env = Envelope::new("TEST", json!({"code": "RATE_LIMITED"}));
        assert_eq!(env.error_code(), None);
    }
}
