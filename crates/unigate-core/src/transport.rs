//! Abstract transport connection for unigate.
//!
//! The gateway never builds raw frames itself: WebSocket and in-memory
//! implementations both satisfy this trait and hand the core whole messages.

use crate::error::GateResult;
use crate::token::AuthToken;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = GateResult<T>> + Send + 'a>>;

/// Close codes sent when the gateway ends a connection.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol fault.
    pub const PROTOCOL: u16 = 1002;
    /// Authentication refused (policy violation).
    pub const POLICY: u16 = 1008;
    /// Server at capacity.
    pub const TRY_AGAIN: u16 = 1013;
    /// Session taken over by a newer connection (application range).
    pub const EVICTED: u16 = 4001;
}

/// One physical, message-oriented connection.
pub trait Transport: Send {
    /// Receive the next whole message.
    ///
    /// `Ok(None)` means the peer closed cleanly; `Err` means the connection
    /// dropped. Must be cancel-safe: it is polled inside `select!`.
    fn recv(&mut self) -> TransportFuture<'_, Option<Vec<u8>>>;

    /// Send one whole message and wait for it to be flushed.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Close the connection with a code and reason.
    fn close<'a>(&'a mut self, code: u16, reason: &'a str) -> TransportFuture<'a, ()>;

    /// Credential presented during the transport handshake, if any.
    fn credential(&self) -> Option<AuthToken>;

    /// Human-readable peer label (remote address) for logs and auth throttling.
    fn peer(&self) -> String;
}
