//! Per-connection task.
//!
//! Drives one transport through its lifecycle: authenticate, bind to the
//! user's session, replay anything queued while the user was away, then pump
//! messages until the client closes, the transport drops, a newer connection
//! evicts this one, or the client sends too much garbage.

use crate::auth::RateDecision;
use crate::dispatcher::GatewayContext;
use crate::session::{Binding, ConnectionState, ControlRequest, ReleaseReason};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use unigate_core::{
    close_code, codec, kind, AuthToken, ConnectionId, Envelope, ErrorCode, GateError, GateResult,
    Transport, UserIdentity,
};

/// How a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Turned away before authenticating because the server is full.
    Rejected,
    /// Authentication failed with the given code.
    Refused(ErrorCode),
    /// The client closed cleanly.
    Closed,
    /// The transport dropped; the session stays resumable.
    Dropped,
    /// A newer connection for the same user took over.
    Evicted,
    /// Too many consecutive malformed messages.
    Faulted,
}

enum Exit {
    Closed,
    /// Carries messages taken from the outbound queue but not sent.
    Dropped(Vec<Envelope>),
    Evicted,
    Fault(String),
}

pub struct Connection<T> {
    id: ConnectionId,
    transport: T,
    ctx: Arc<GatewayContext>,
    peer: String,
    state: ConnectionState,
    decode_failures: u32,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(transport: T, ctx: Arc<GatewayContext>) -> Self {
        let peer = transport.peer();
        Self {
            id: ConnectionId::next(),
            transport,
            ctx,
            peer,
            state: ConnectionState::Disconnected,
            decode_failures: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn run(mut self) -> ConnectionOutcome {
        info!(conn = %self.id, peer = %self.peer, "connection opened");
        self.set_state(ConnectionState::Connecting);

        let user = match self.authenticate().await {
            Ok(user) => user,
            Err(e) => return self.refuse(e).await,
        };

        let (outbound_tx, mut outbound_rx) =
            mpsc::channel(self.ctx.config.outbox_capacity.max(1));
        let (control_tx, mut control_rx) = mpsc::channel(1);
        let binding = Binding {
            conn_id: self.id,
            outbound: outbound_tx,
            control: control_tx,
        };
        let acquired = self.ctx.registry.acquire(&user, binding).await;

        let success = Envelope::new(
            kind::AUTH_SUCCESS,
            json!({
                "user_id": user.as_str(),
                "connection_id": self.id.get(),
                "connected": true,
                "resumed": acquired.resumed,
                "reconnect_count": acquired.reconnect_count,
            }),
        );

        let exit = match self.start(&success, acquired.replay).await {
            Ok(()) => {
                // Not confirmed means a newer connection already took over;
                // the pump picks up its pending eviction first.
                if self.ctx.registry.confirm(self.id).await {
                    self.set_state(ConnectionState::Connected);
                    info!(conn = %self.id, user = %user, "connection authenticated");
                } else {
                    debug!(conn = %self.id, user = %user, "superseded during setup");
                }
                self.pump(&user, &mut outbound_rx, &mut control_rx).await
            }
            Err(exit) => exit,
        };

        self.finish(&user, exit, outbound_rx, control_rx).await
    }

    async fn authenticate(&mut self) -> GateResult<UserIdentity> {
        if let RateDecision::Denied { retry_after } =
            self.ctx.limits.auth.check_and_consume(&self.peer)
        {
            warn!(peer = %self.peer, "too many authentication attempts");
            return Err(GateError::RateLimited { retry_after });
        }

        let token = match self.transport.credential() {
            Some(token) => token,
            None => self.await_credential().await?,
        };
        self.ctx.auth.authenticate(&token)
    }

    /// Wait for an in-band `AUTH` message when the handshake carried no token.
    async fn await_credential(&mut self) -> GateResult<AuthToken> {
        let frame =
            match tokio::time::timeout(self.ctx.config.auth_timeout, self.transport.recv()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    return Err(GateError::AuthInvalid(
                        "no credential presented in time".to_string(),
                    ))
                }
            };
        let Some(bytes) = frame else {
            return Err(GateError::Transport(
                "closed before authenticating".to_string(),
            ));
        };

        let envelope = codec::decode(&bytes)
            .map_err(|e| GateError::AuthInvalid(format!("first message: {e}")))?;
        if !envelope.is(kind::AUTH) {
            return Err(GateError::AuthInvalid(format!(
                "expected AUTH, got {}",
                envelope.kind
            )));
        }
        credential_from(&envelope)
            .ok_or_else(|| GateError::AuthInvalid("AUTH without a token".to_string()))
    }

    async fn refuse(mut self, error: GateError) -> ConnectionOutcome {
        let Some(code) = error.code() else {
            debug!(conn = %self.id, error = %error, "connection lost during authentication");
            self.set_state(ConnectionState::Disconnected);
            return ConnectionOutcome::Dropped;
        };

        info!(conn = %self.id, peer = %self.peer, code = %code, "authentication refused");
        self.set_state(ConnectionState::Error);

        let retry_after = match &error {
            GateError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let mut failure = Envelope::error(code, error.to_string(), retry_after);
        failure.kind = kind::AUTH_FAILURE.to_string();
        if let Err(e) = self.send_envelope(&failure).await {
            debug!(conn = %self.id, error = %e, "could not deliver AUTH_FAILURE");
        }
        let _ = self
            .transport
            .close(close_code::POLICY, "authentication failed")
            .await;
        ConnectionOutcome::Refused(code)
    }

    /// Send AUTH_SUCCESS and then the replay, oldest first.
    async fn start(&mut self, success: &Envelope, replay: Vec<Envelope>) -> Result<(), Exit> {
        if let Err(e) = self.send_envelope(success).await {
            debug!(conn = %self.id, error = %e, "send failed during setup");
            return Err(Exit::Dropped(replay));
        }

        let mut pending = replay.into_iter();
        while let Some(envelope) = pending.next() {
            if let Err(e) = self.send_envelope(&envelope).await {
                debug!(conn = %self.id, error = %e, "send failed during replay");
                let mut unsent = vec![envelope];
                unsent.extend(pending);
                return Err(Exit::Dropped(unsent));
            }
        }
        Ok(())
    }

    async fn pump(
        &mut self,
        user: &UserIdentity,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
        control_rx: &mut mpsc::Receiver<ControlRequest>,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;

                Some(request) = control_rx.recv() => {
                    let ControlRequest::Evict { ack } = request;
                    self.step_down(outbound_rx, ack).await;
                    return Exit::Evicted;
                }

                Some(envelope) = outbound_rx.recv() => {
                    if let Err(e) = self.send_envelope(&envelope).await {
                        debug!(conn = %self.id, error = %e, "outbound send failed");
                        return Exit::Dropped(vec![envelope]);
                    }
                }

                inbound = self.transport.recv() => match inbound {
                    Ok(Some(bytes)) => {
                        if let Some(exit) = self.handle_inbound(user, &bytes).await {
                            return exit;
                        }
                    }
                    Ok(None) => return Exit::Closed,
                    Err(e) => {
                        debug!(conn = %self.id, error = %e, "transport dropped");
                        return Exit::Dropped(Vec::new());
                    }
                },
            }
        }
    }

    /// Rate limit, decode, route. Returns `Some` when the connection must end.
    async fn handle_inbound(&mut self, user: &UserIdentity, bytes: &[u8]) -> Option<Exit> {
        if let RateDecision::Denied { retry_after } =
            self.ctx.limits.messages.check_and_consume(user.as_str())
        {
            debug!(conn = %self.id, user = %user, "message rate limited");
            let reply = Envelope::error(
                ErrorCode::RateLimited,
                "rate limit exceeded",
                Some(retry_after),
            );
            return self.reply(reply).await;
        }

        let envelope = match codec::decode(bytes) {
            Ok(envelope) => {
                self.decode_failures = 0;
                envelope
            }
            Err(e) => {
                self.decode_failures += 1;
                if self.decode_failures > self.ctx.config.max_decode_failures {
                    return Some(Exit::Fault(format!(
                        "{} consecutive malformed messages",
                        self.decode_failures
                    )));
                }
                debug!(conn = %self.id, error = %e, "rejected inbound message");
                let code = e.code().unwrap_or(ErrorCode::InvalidFormat);
                return self.reply(Envelope::error(code, e.to_string(), None)).await;
            }
        };

        self.ctx.registry.touch(user);

        if envelope.is(kind::PING) {
            return self.reply(Envelope::new(kind::PONG, envelope.data)).await;
        }
        if envelope.is(kind::AUTH) {
            debug!(conn = %self.id, "ignoring AUTH on an authenticated connection");
            return None;
        }

        match self.ctx.router.route(user, envelope) {
            Some(reply) => self.reply(reply).await,
            None => None,
        }
    }

    async fn reply(&mut self, envelope: Envelope) -> Option<Exit> {
        match self.send_envelope(&envelope).await {
            Ok(()) => None,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "reply send failed");
                Some(Exit::Dropped(Vec::new()))
            }
        }
    }

    /// Encode and send. Oversized envelopes are replaced by a
    /// `MESSAGE_TOO_LARGE` error; only transport failures are returned.
    async fn send_envelope(&mut self, envelope: &Envelope) -> GateResult<()> {
        let bytes = match codec::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e @ GateError::MessageTooLarge { .. }) => {
                warn!(conn = %self.id, kind = %envelope.kind, error = %e, "outbound message too large");
                codec::encode(&Envelope::error(
                    ErrorCode::MessageTooLarge,
                    e.to_string(),
                    None,
                ))?
            }
            Err(e) => {
                warn!(conn = %self.id, kind = %envelope.kind, error = %e, "could not encode outbound message");
                return Ok(());
            }
        };
        self.transport.send(&bytes).await
    }

    /// Hand the session over to a newer connection.
    async fn step_down(
        &mut self,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
        ack: oneshot::Sender<Vec<Envelope>>,
    ) {
        self.set_state(ConnectionState::Disconnected);
        let unsent = drain(outbound_rx);
        info!(conn = %self.id, unsent = unsent.len(), "evicted by a newer connection");
        let _ = ack.send(unsent);

        let notice = Envelope::error(
            ErrorCode::SessionEvicted,
            GateError::SessionEvicted.to_string(),
            None,
        );
        if let Err(e) = self.send_envelope(&notice).await {
            debug!(conn = %self.id, error = %e, "could not notify evicted client");
        }
        let _ = self
            .transport
            .close(close_code::EVICTED, "session evicted")
            .await;
    }

    async fn finish(
        mut self,
        user: &UserIdentity,
        exit: Exit,
        mut outbound_rx: mpsc::Receiver<Envelope>,
        mut control_rx: mpsc::Receiver<ControlRequest>,
    ) -> ConnectionOutcome {
        let (reason, outcome, mut unsent) = match exit {
            Exit::Evicted => return ConnectionOutcome::Evicted,
            Exit::Closed => {
                info!(conn = %self.id, user = %user, "connection closed by client");
                self.set_state(ConnectionState::Disconnected);
                (ReleaseReason::Closed, ConnectionOutcome::Closed, Vec::new())
            }
            Exit::Dropped(unsent) => {
                info!(conn = %self.id, user = %user, "connection dropped");
                if self.state == ConnectionState::Connected {
                    self.set_state(ConnectionState::Reconnecting);
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
                (ReleaseReason::Dropped, ConnectionOutcome::Dropped, unsent)
            }
            Exit::Fault(reason) => {
                warn!(conn = %self.id, user = %user, reason = %reason, "protocol fault");
                self.set_state(ConnectionState::Error);
                let notice = Envelope::error(ErrorCode::ProtocolFault, reason, None);
                let _ = self.send_envelope(&notice).await;
                let _ = self
                    .transport
                    .close(close_code::PROTOCOL, "protocol fault")
                    .await;
                (ReleaseReason::Fault, ConnectionOutcome::Faulted, Vec::new())
            }
        };

        unsent.extend(drain(&mut outbound_rx));

        // Refuse further control requests, but answer one already in flight:
        // its sender holds the session lock and is waiting for us.
        control_rx.close();
        if let Ok(ControlRequest::Evict { ack }) = control_rx.try_recv() {
            let _ = ack.send(unsent);
            return outcome;
        }

        let registry = &self.ctx.registry;
        if registry.release(self.id, reason, unsent.clone()).await.is_none() {
            for envelope in unsent {
                registry.deliver(user, envelope).await;
            }
        }
        // Anything that slipped in before the binding was dropped.
        for envelope in drain(&mut outbound_rx) {
            registry.deliver(user, envelope).await;
        }
        outcome
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(conn = %self.id, from = %self.state, to = %next, "illegal connection transition");
            return;
        }
        debug!(conn = %self.id, from = %self.state, to = %next, "connection state");
        self.state = next;
    }
}

fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut pending = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        pending.push(envelope);
    }
    pending
}

/// Token carried by an `AUTH` envelope: `data` as a string, `data.token`,
/// or a top-level `token` field.
fn credential_from(envelope: &Envelope) -> Option<AuthToken> {
    let token = match &envelope.data {
        Value::String(token) => token.as_str(),
        Value::Object(map) => map.get("token")?.as_str()?,
        _ => envelope.field("token")?.as_str()?,
    };
    (!token.is_empty()).then(|| AuthToken::new(token))
}
