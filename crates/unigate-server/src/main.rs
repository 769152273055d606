//! unigate-server: real-time session gateway.
//!
//! Accepts WebSocket connections, authenticates them with bearer tokens,
//! keeps one resumable session per user and rate-limits inbound messages.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use unigate_core::{issue_token, UserIdentity};
use unigate_server::config::{CliOverrides, ServerConfig, SECRET_ENV};
use unigate_server::router::EchoRouter;
use unigate_server::server::GatewayServer;

/// unigate-server: real-time session gateway
#[derive(Parser, Debug)]
#[command(name = "unigate-server", version, about = "Real-time session gateway")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.unigate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve(ServeArgs),

    /// Mint a bearer token with the configured secret
    Token {
        /// User the token is issued for
        #[arg(long)]
        user: String,

        /// Lifetime in seconds (defaults to `[auth] token_ttl`)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds a dropped session stays resumable
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Messages allowed per user per window
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Rate-limit window in seconds
    #[arg(long)]
    rate_window: Option<u64>,
}

impl ServeArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            port: self.port,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            rate_limit: self.rate_limit,
            rate_window: self.rate_window,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    match cli.command {
        Some(Command::Token { user, ttl }) => mint_token(&config_path, &user, ttl),
        Some(Command::Serve(args)) => serve(&config_path, &args).await,
        None => serve(&config_path, &ServeArgs::default()).await,
    }
}

async fn serve(config_path: &std::path::Path, args: &ServeArgs) {
    let server_config = match ServerConfig::load(Some(config_path), &args.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        "starting unigate-server"
    );

    let server = GatewayServer::new(server_config, Arc::new(EchoRouter));

    // Run until shutdown signal
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("unigate-server stopped");
}

fn mint_token(config_path: &std::path::Path, user: &str, ttl: Option<u64>) {
    let server_config = match ServerConfig::load(Some(config_path), &CliOverrides::default()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    if server_config.ephemeral_secret {
        error!("no secret configured; set {SECRET_ENV} or [auth] secret");
        std::process::exit(1);
    }

    let ttl = ttl.unwrap_or(server_config.token_ttl);
    let token = issue_token(&server_config.secret, &UserIdentity::new(user), ttl);
    println!("{}", token.as_str());
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
