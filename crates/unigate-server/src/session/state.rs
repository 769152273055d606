//! Connection lifecycle states.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of a connection and of the session it is bound to.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
///                                          \-> Disconnected
/// any -> Error (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Error, _) => false,
            (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Reconnecting) | (Connected, Disconnected) => true,
            // A new connection re-acquiring a dropped session starts over at Connecting.
            (Reconnecting, Connecting) | (Reconnecting, Connected) | (Reconnecting, Disconnected) => {
                true
            }
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Disconnected));
    }

    #[test]
    fn error_is_terminal_and_reachable_from_anywhere() {
        for s in [Disconnected, Connecting, Connected, Reconnecting] {
            assert!(s.can_transition_to(Error));
            assert!(!Error.can_transition_to(s));
        }
        assert!(Error.is_terminal());
    }

    #[test]
    fn shortcuts_are_illegal() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
    }
}
