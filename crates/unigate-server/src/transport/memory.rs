//! In-process transport and a scripted client on top of it.
//!
//! [`pair`] returns the server half (a [`Transport`]) and the raw peer half.
//! [`MemoryClient`] wraps the peer half with the client side of the protocol
//! (connect, send, receive, drop, resume) so gateway behavior can be
//! exercised without sockets.

use crate::connection::ConnectionOutcome;
use crate::dispatcher::Gateway;
use crate::session::ConnectionState;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use unigate_core::{
    close_code, codec, kind, AuthToken, Envelope, ErrorCode, GateError, GateResult, Transport,
    TransportFuture, UserIdentity,
};

/// Client → server frames.
#[derive(Debug)]
pub enum ClientFrame {
    Data(Vec<u8>),
    /// Clean close.
    Close,
    /// Abrupt loss of the connection.
    Reset,
}

/// Server → client frames.
#[derive(Debug)]
pub enum ServerFrame {
    Data(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Server half of an in-memory connection.
pub struct MemoryTransport {
    credential: Option<AuthToken>,
    peer: String,
    incoming: mpsc::UnboundedReceiver<ClientFrame>,
    outgoing: mpsc::UnboundedSender<ServerFrame>,
}

/// Client half of an in-memory connection.
pub struct MemoryPeer {
    pub outgoing: mpsc::UnboundedSender<ClientFrame>,
    pub incoming: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Create a connected transport/peer pair.
pub fn pair(credential: Option<AuthToken>, peer: impl Into<String>) -> (MemoryTransport, MemoryPeer) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let transport = MemoryTransport {
        credential,
        peer: peer.into(),
        incoming: client_rx,
        outgoing: server_tx,
    };
    let peer = MemoryPeer {
        outgoing: client_tx,
        incoming: server_rx,
    };
    (transport, peer)
}

impl Transport for MemoryTransport {
    fn recv(&mut self) -> TransportFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            match self.incoming.recv().await {
                Some(ClientFrame::Data(data)) => Ok(Some(data)),
                Some(ClientFrame::Close) => Ok(None),
                Some(ClientFrame::Reset) | None => {
                    Err(GateError::Transport("connection reset by peer".to_string()))
                }
            }
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.outgoing
                .send(ServerFrame::Data(data.to_vec()))
                .map_err(|_| GateError::Transport("peer is gone".to_string()))
        })
    }

    fn close<'a>(&'a mut self, code: u16, reason: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.outgoing.send(ServerFrame::Close {
                code,
                reason: reason.to_string(),
            });
            self.incoming.close();
            Ok(())
        })
    }

    fn credential(&self) -> Option<AuthToken> {
        self.credential.clone()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Protocol-level client over an in-memory transport.
///
/// Tracks the client's view of the connection state and the reconnect count
/// the server reported in its last `AUTH_SUCCESS`.
pub struct MemoryClient {
    gateway: Gateway,
    token: AuthToken,
    peer: String,
    link: Option<MemoryPeer>,
    task: Option<JoinHandle<ConnectionOutcome>>,
    state: ConnectionState,
    user: Option<UserIdentity>,
    reconnect_count: u32,
}

impl MemoryClient {
    pub fn new(gateway: Gateway, token: AuthToken) -> Self {
        Self::with_peer(gateway, token, "memory")
    }

    /// Client whose connections report `peer` as their remote address.
    pub fn with_peer(gateway: Gateway, token: AuthToken, peer: impl Into<String>) -> Self {
        Self {
            gateway,
            token,
            peer: peer.into(),
            link: None,
            task: None,
            state: ConnectionState::Disconnected,
            user: None,
            reconnect_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// User the server authenticated us as.
    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    /// Swap in a refreshed token for the next `connect`.
    pub fn set_token(&mut self, token: AuthToken) {
        self.token = token;
    }

    /// Open a connection and wait for the authentication verdict.
    pub async fn connect(&mut self) -> GateResult<()> {
        self.link = None;
        self.state = ConnectionState::Connecting;

        let (transport, peer) = pair(Some(self.token.clone()), self.peer.clone());
        self.task = Some(self.gateway.accept(transport));
        self.link = Some(peer);

        let verdict = match self.next_envelope().await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.state = ConnectionState::Error;
                return Err(e);
            }
        };

        if verdict.is(kind::AUTH_SUCCESS) {
            self.user = verdict
                .data
                .get("user_id")
                .and_then(|u| u.as_str())
                .map(UserIdentity::new);
            self.reconnect_count = verdict
                .data
                .get("reconnect_count")
                .and_then(|c| c.as_u64())
                .unwrap_or(0) as u32;
            self.state = ConnectionState::Connected;
            debug!(user = ?self.user, reconnects = self.reconnect_count, "memory client connected");
            return Ok(());
        }

        self.state = ConnectionState::Error;
        self.link = None;
        Err(error_from(&verdict))
    }

    /// Close cleanly and wait for the server to finish with the connection.
    pub async fn disconnect(&mut self) -> Option<ConnectionOutcome> {
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(ClientFrame::Close);
        }
        if self.state != ConnectionState::Error {
            self.state = ConnectionState::Disconnected;
        }
        self.outcome().await
    }

    /// Sever the connection abruptly, as a network failure would.
    pub async fn drop_link(&mut self) -> Option<ConnectionOutcome> {
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(ClientFrame::Reset);
        }
        self.state = ConnectionState::Reconnecting;
        self.outcome().await
    }

    /// Drop the connection, stay away for `downtime`, then reconnect.
    pub async fn simulate_drop(&mut self, downtime: Duration) -> GateResult<()> {
        self.drop_link().await;
        tokio::time::sleep(downtime).await;
        self.connect().await
    }

    /// Encode and send `envelope`. Only allowed while Connected.
    pub fn send(&mut self, envelope: &Envelope) -> GateResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(GateError::Transport(format!(
                "cannot send while {}",
                self.state
            )));
        }
        let bytes = codec::encode(envelope)?;
        self.send_raw(bytes)
    }

    /// Send raw bytes, bypassing the codec.
    pub fn send_raw(&mut self, bytes: impl Into<Vec<u8>>) -> GateResult<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| GateError::Transport("not connected".to_string()))?;
        link.outgoing
            .send(ClientFrame::Data(bytes.into()))
            .map_err(|_| GateError::Transport("connection lost".to_string()))
    }

    /// Next envelope from the server.
    ///
    /// Connection-level errors update the client state as they arrive.
    pub async fn receive(&mut self) -> GateResult<Envelope> {
        let envelope = self.next_envelope().await?;
        match envelope.error_code() {
            Some(ErrorCode::SessionEvicted) => self.state = ConnectionState::Disconnected,
            Some(ErrorCode::ProtocolFault) => self.state = ConnectionState::Error,
            _ => {}
        }
        Ok(envelope)
    }

    /// [`receive`](Self::receive) with an upper bound on the wait.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> GateResult<Envelope> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| GateError::Timeout)?
    }

    /// Send and wait for the next envelope.
    pub async fn request(&mut self, envelope: &Envelope) -> GateResult<Envelope> {
        self.send(envelope)?;
        self.receive().await
    }

    /// Wait for the server-side task of the last connection to end.
    pub async fn outcome(&mut self) -> Option<ConnectionOutcome> {
        let task = self.task.take()?;
        task.await.ok()
    }

    async fn next_envelope(&mut self) -> GateResult<Envelope> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| GateError::Transport("not connected".to_string()))?;
        match link.incoming.recv().await {
            Some(ServerFrame::Data(bytes)) => codec::decode(&bytes),
            Some(ServerFrame::Close { code, reason }) => {
                self.link = None;
                if self.state != ConnectionState::Error {
                    self.state = ConnectionState::Disconnected;
                }
                if code == close_code::TRY_AGAIN {
                    return Err(GateError::Other(format!("server busy: {reason}")));
                }
                Err(GateError::Transport(format!(
                    "closed by server ({code}): {reason}"
                )))
            }
            None => {
                self.link = None;
                self.state = ConnectionState::Disconnected;
                Err(GateError::Transport("connection lost".to_string()))
            }
        }
    }
}

/// Rebuild the error carried by an `AUTH_FAILURE` / `ERROR` envelope.
fn error_from(envelope: &Envelope) -> GateError {
    let message = envelope
        .data
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or_default()
        .to_string();
    match envelope.error_code() {
        Some(code) => GateError::from_code(code, message, envelope.retry_after()),
        None => GateError::ProtocolFault(format!("unexpected {} during connect", envelope.kind)),
    }
}
