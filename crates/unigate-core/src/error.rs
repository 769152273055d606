use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the unigate protocol and session layers.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("token expired")]
    AuthExpired,

    #[error("authentication failed: {0}")]
    AuthInvalid(String),

    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("session taken over by a newer connection")]
    SessionEvicted,

    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;

/// Reason codes surfaced to clients on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthExpired,
    AuthInvalid,
    RateLimited,
    MessageTooLarge,
    InvalidFormat,
    SessionEvicted,
    ProtocolFault,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthExpired => "AUTH_EXPIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::SessionEvicted => "SESSION_EVICTED",
            ErrorCode::ProtocolFault => "PROTOCOL_FAULT",
        }
    }

    /// Whether an error with this code ends the physical connection.
    ///
    /// Per-message codes (`RATE_LIMITED`, `INVALID_FORMAT`, `MESSAGE_TOO_LARGE`)
    /// only reject the offending message.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthExpired
                | ErrorCode::AuthInvalid
                | ErrorCode::SessionEvicted
                | ErrorCode::ProtocolFault
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GateError {
    /// Wire code for this error, if it is one clients are told about.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            GateError::AuthExpired => Some(ErrorCode::AuthExpired),
            GateError::AuthInvalid(_) => Some(ErrorCode::AuthInvalid),
            GateError::RateLimited { .. } => Some(ErrorCode::RateLimited),
            GateError::MessageTooLarge { .. } => Some(ErrorCode::MessageTooLarge),
            GateError::InvalidFormat(_) => Some(ErrorCode::InvalidFormat),
            GateError::SessionEvicted => Some(ErrorCode::SessionEvicted),
            GateError::ProtocolFault(_) => Some(ErrorCode::ProtocolFault),
            _ => None,
        }
    }

    /// Rebuild an error from a wire code (client side of the protocol).
    pub fn from_code(code: ErrorCode, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::AuthExpired => GateError::AuthExpired,
            ErrorCode::AuthInvalid => GateError::AuthInvalid(message),
            ErrorCode::RateLimited => GateError::RateLimited {
                retry_after: retry_after.unwrap_or_default(),
            },
            ErrorCode::MessageTooLarge => GateError::MessageTooLarge {
                size: 0,
                max: crate::codec::MAX_ENVELOPE_SIZE,
            },
            ErrorCode::InvalidFormat => GateError::InvalidFormat(message),
            ErrorCode::SessionEvicted => GateError::SessionEvicted,
            ErrorCode::ProtocolFault => GateError::ProtocolFault(message),
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::InvalidFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let s = serde_json::to_string(&ErrorCode::MessageTooLarge).unwrap();
        assert_eq!(s, "\"MESSAGE_TOO_LARGE\"");
        assert_eq!(ErrorCode::MessageTooLarge.as_str(), "MESSAGE_TOO_LARGE");
    }

    #[test]
    fn per_message_codes_keep_connection() {
        assert!(!ErrorCode::RateLimited.is_connection_level());
        assert!(!ErrorCode::InvalidFormat.is_connection_level());
        assert!(ErrorCode::SessionEvicted.is_connection_level());
        assert!(ErrorCode::AuthExpired.is_connection_level());
    }

    #[test]
    fn transport_errors_have_no_wire_code() {
        assert_eq!(GateError::Transport("reset".into()).code(), None);
        assert_eq!(
            GateError::RateLimited { retry_after: Duration::from_secs(1) }.code(),
            Some(ErrorCode::RateLimited)
        );
    }
}
