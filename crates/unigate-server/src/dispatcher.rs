//! Gateway dispatcher.
//!
//! `Gateway` is the cloneable handle the rest of the server talks to. It owns
//! the shared state (auth gate, rate limiters, session registry, router) and
//! spawns one [`Connection`] task per accepted transport.

use crate::auth::{AuthGate, RateDecision, ServerRateLimits};
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionOutcome};
use crate::router::MessageRouter;
use crate::session::{Delivery, SessionRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use unigate_core::{
    close_code, codec, AuthToken, Envelope, GateResult, Transport, UserIdentity,
};

/// State shared by every connection task.
pub struct GatewayContext {
    pub(crate) config: GatewayConfig,
    pub(crate) auth: AuthGate,
    pub(crate) limits: ServerRateLimits,
    pub(crate) registry: SessionRegistry,
    pub(crate) router: Arc<dyn MessageRouter>,
    active: AtomicUsize,
}

/// Releases a connection slot when the task ends.
struct ActiveGuard(Arc<GatewayContext>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Gateway {
    ctx: Arc<GatewayContext>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, auth: AuthGate, router: Arc<dyn MessageRouter>) -> Self {
        let limits = ServerRateLimits::new(&config);
        Self::with_limits(config, auth, limits, router)
    }

    /// Gateway with caller-supplied limiters (e.g. backed by a shared counter store).
    pub fn with_limits(
        config: GatewayConfig,
        auth: AuthGate,
        limits: ServerRateLimits,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        let registry = SessionRegistry::from_config(&config);
        Self {
            ctx: Arc::new(GatewayContext {
                config,
                auth,
                limits,
                registry,
                router,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.ctx.config
    }

    /// Take ownership of a new transport and drive it on its own task.
    ///
    /// Beyond `max_connections` the transport is closed with
    /// `TRY_AGAIN` before authentication.
    pub fn accept<T>(&self, transport: T) -> JoinHandle<ConnectionOutcome>
    where
        T: Transport + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let max = ctx.config.max_connections;
        let admitted = ctx
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        let slot = admitted.then(|| ActiveGuard(Arc::clone(&ctx)));

        tokio::spawn(async move {
            let mut transport = transport;
            let Some(_slot) = slot else {
                warn!(peer = %transport.peer(), max, "connection limit reached");
                let _ = transport
                    .close(close_code::TRY_AGAIN, "server at capacity")
                    .await;
                return ConnectionOutcome::Rejected;
            };
            Connection::new(transport, ctx).run().await
        })
    }

    /// Number of connection tasks currently running.
    pub fn active_connections(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    pub fn authenticate(&self, token: &AuthToken) -> GateResult<UserIdentity> {
        self.ctx.auth.authenticate(token)
    }

    /// Consume one unit of `user`'s message budget.
    pub fn check_and_consume(&self, user: &UserIdentity) -> RateDecision {
        self.ctx.limits.messages.check_and_consume(user.as_str())
    }

    /// Clear `user`'s message budget.
    pub fn reset_rate_limit(&self, user: &UserIdentity) {
        self.ctx.limits.messages.reset(user.as_str());
    }

    pub fn encode(&self, envelope: &Envelope) -> GateResult<Vec<u8>> {
        codec::encode(envelope)
    }

    pub fn decode(&self, bytes: &[u8]) -> GateResult<Envelope> {
        codec::decode(bytes)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    /// Push a server-originated message to `user`.
    pub async fn deliver(&self, user: &UserIdentity, envelope: Envelope) -> Delivery {
        self.ctx.registry.deliver(user, envelope).await
    }

    /// End `user`'s session, evicting any live connection.
    pub async fn logout(&self, user: &UserIdentity) -> bool {
        self.ctx.registry.logout(user).await
    }

    /// Drop expired sessions and rate-limit buckets. Returns sessions removed.
    pub async fn sweep(&self) -> usize {
        let sessions = self.ctx.registry.sweep().await.len();
        let buckets = self.ctx.limits.gc();
        debug!(sessions, buckets, "maintenance sweep");
        sessions
    }
}
