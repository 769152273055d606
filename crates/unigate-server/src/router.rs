//! Application routing for decoded envelopes.
//!
//! The gateway does not interpret payloads. Every envelope that passes rate
//! limiting and decoding is handed to a [`MessageRouter`]; whatever it returns
//! is sent back on the same connection.

use unigate_core::{kind, Envelope, UserIdentity};

/// Backend hook for inbound messages.
///
/// Called from the connection's task, one message at a time, in receipt order.
pub trait MessageRouter: Send + Sync {
    /// Handle one message from `user`, optionally producing a reply.
    fn route(&self, user: &UserIdentity, envelope: Envelope) -> Option<Envelope>;
}

/// Echoes every envelope back with a fresh server timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRouter;

impl MessageRouter for EchoRouter {
    fn route(&self, _user: &UserIdentity, mut envelope: Envelope) -> Option<Envelope> {
        envelope.timestamp = Some(unigate_core::now_millis());
        if envelope.kind != kind::ECHO {
            let origin = std::mem::replace(&mut envelope.kind, kind::ECHO.to_string());
            envelope.extra.insert("echo_of".to_string(), origin.into());
        }
        Some(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn echo_keeps_data_and_type() {
        let mut env = Envelope::new(kind::ECHO, "test123");
        env.timestamp = Some(1);
        let reply = EchoRouter.route(&UserIdentity::new("u"), env).unwrap();
        assert_eq!(reply.kind, "ECHO");
        assert_eq!(reply.data, json!("test123"));
        assert!(reply.timestamp.unwrap() > 1);
    }

    #[test]
    fn echo_of_other_types_records_origin() {
        let env = Envelope::new("CHARACTER_CHAT", json!({"message": "Hello!"}));
        let reply = EchoRouter.route(&UserIdentity::new("u"), env).unwrap();
        assert_eq!(reply.kind, "ECHO");
        assert_eq!(reply.field("echo_of"), Some(&json!("CHARACTER_CHAT")));
    }
}
