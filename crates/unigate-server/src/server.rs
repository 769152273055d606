//! Core server: binds the WebSocket listener and feeds connections into the
//! gateway.
//!
//! Also owns the maintenance loop that sweeps expired sessions and stale
//! rate-limit buckets.

use crate::auth::AuthGate;
use crate::config::ServerConfig;
use crate::dispatcher::Gateway;
use crate::router::MessageRouter;
use crate::transport::websocket;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use unigate_core::{GateError, GateResult};

/// The unigate server instance.
pub struct GatewayServer {
    config: ServerConfig,
    gateway: Gateway,
}

impl GatewayServer {
    /// Create a server with HMAC authentication and the given router.
    pub fn new(config: ServerConfig, router: Arc<dyn MessageRouter>) -> Self {
        let auth = AuthGate::hmac(config.secret.clone());
        let gateway = Gateway::new(config.gateway.clone(), auth, router);
        Self { config, gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Listen for WebSocket clients until the listener closes.
    pub async fn run(self) -> GateResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| GateError::Config(format!("invalid address: {e}")))?;

        let mut ws_rx = websocket::start_listener(addr).await?;

        let gc_gateway = self.gateway.clone();
        let sweep_interval = self.config.gateway.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = gc_gateway.sweep().await;
                if removed > 0 {
                    info!(removed, "swept expired sessions");
                }
            }
        });

        info!(
            addr = %addr,
            max_connections = self.config.gateway.max_connections,
            idle_timeout_secs = self.config.gateway.idle_timeout.as_secs(),
            "unigate-server ready"
        );

        while let Some(transport) = ws_rx.recv().await {
            let remote = transport.remote_addr();
            let handle = self.gateway.accept(transport);
            tokio::spawn(async move {
                match handle.await {
                    Ok(outcome) => info!(remote = %remote, outcome = ?outcome, "connection finished"),
                    Err(e) => warn!(remote = %remote, error = %e, "connection task failed"),
                }
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }
}
