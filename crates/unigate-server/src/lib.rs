//! unigate-server: session gateway library.
//!
//! The binary wires these pieces to a WebSocket listener; embedders and tests
//! can drive a [`Gateway`](dispatcher::Gateway) with any
//! [`Transport`](unigate_core::Transport), including the in-memory one.

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use connection::ConnectionOutcome;
pub use dispatcher::Gateway;
pub use router::{EchoRouter, MessageRouter};
