//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use unigate_core::{GateError, GateResult};

/// Environment variable holding the hex-encoded token secret.
pub const SECRET_ENV: &str = "UNIGATE_SECRET";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret. Overridden by `UNIGATE_SECRET`.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
    #[serde(default = "default_auth_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window")]
    pub attempt_window: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl: default_token_ttl(),
            auth_timeout: default_auth_timeout(),
            max_attempts: default_auth_attempts(),
            attempt_window: default_window(),
        }
    }
}

/// `[limits]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Messages allowed per user per window.
    #[serde(default = "default_rate_limit")]
    pub messages: u32,
    /// Window length in seconds.
    #[serde(default = "default_window")]
    pub window: u64,
    #[serde(default = "default_max_decode_failures")]
    pub max_decode_failures: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            messages: default_rate_limit(),
            window: default_window(),
            max_decode_failures: default_max_decode_failures(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Seconds a dropped session may be resumed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_eviction_timeout")]
    pub eviction_timeout: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            outbox_capacity: default_outbox_capacity(),
            eviction_timeout: default_eviction_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_max_connections() -> usize {
    1000
}
fn default_token_ttl() -> u64 {
    3600
}
fn default_auth_timeout() -> u64 {
    10
}
fn default_auth_attempts() -> u32 {
    10
}
fn default_window() -> u64 {
    60
}
fn default_rate_limit() -> u32 {
    50
}
fn default_max_decode_failures() -> u32 {
    5
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_outbox_capacity() -> usize {
    256
}
fn default_eviction_timeout() -> u64 {
    5
}
fn default_sweep_interval() -> u64 {
    60
}

/// Gateway tuning shared by the dispatcher, registry and limiters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum concurrently open connections.
    pub max_connections: usize,
    /// Messages allowed per user per `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Auth attempts allowed per peer per `auth_window`.
    pub auth_attempts: u32,
    pub auth_window: Duration,
    /// How long a connection may take to present a credential.
    pub auth_timeout: Duration,
    /// Consecutive codec failures tolerated before a protocol fault.
    pub max_decode_failures: u32,
    /// How long a dropped or closed session stays resumable.
    pub idle_timeout: Duration,
    /// Outbound messages buffered per session while it has no connection.
    pub outbox_capacity: usize,
    /// Upper bound on waiting for an evicted connection to acknowledge.
    pub eviction_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            rate_limit: default_rate_limit(),
            rate_window: Duration::from_secs(default_window()),
            auth_attempts: default_auth_attempts(),
            auth_window: Duration::from_secs(default_window()),
            auth_timeout: Duration::from_secs(default_auth_timeout()),
            max_decode_failures: default_max_decode_failures(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            outbox_capacity: default_outbox_capacity(),
            eviction_timeout: Duration::from_secs(default_eviction_timeout()),
            sweep_interval: Duration::from_secs(default_sweep_interval()),
        }
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub rate_limit: Option<u32>,
    pub rate_window: Option<u64>,
}

/// Resolved server configuration (file defaults, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// HMAC secret for bearer tokens.
    pub secret: Vec<u8>,
    /// The secret was generated at startup; tokens die with the process.
    pub ephemeral_secret: bool,
    pub token_ttl: u64,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let env_secret = std::env::var(SECRET_ENV).ok();
        Self::resolve(file_config, cli, env_secret.as_deref())
    }

    /// Merge a parsed file with CLI overrides and the secret from the environment.
    pub fn resolve(
        file: ConfigFile,
        cli: &CliOverrides,
        env_secret: Option<&str>,
    ) -> GateResult<Self> {
        let configured = env_secret.or(file.auth.secret.as_deref());
        let ephemeral_secret = configured.is_none();
        let secret = match configured {
            Some(hex_secret) => {
                let secret = hex::decode(hex_secret.trim())
                    .map_err(|e| GateError::Config(format!("secret is not valid hex: {e}")))?;
                if secret.len() < 16 {
                    return Err(GateError::Config(
                        "secret must be at least 16 bytes".to_string(),
                    ));
                }
                secret
            }
            None => {
                warn!("no token secret configured, generating an ephemeral one");
                unigate_core::generate_secret()
            }
        };

        let rate_limit = cli.rate_limit.unwrap_or(file.limits.messages);
        if rate_limit == 0 {
            return Err(GateError::Config("rate limit must be positive".to_string()));
        }
        let rate_window = cli.rate_window.unwrap_or(file.limits.window);
        if rate_window == 0 {
            return Err(GateError::Config("rate window must be positive".to_string()));
        }

        let gateway = GatewayConfig {
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            rate_limit,
            rate_window: Duration::from_secs(rate_window),
            auth_attempts: file.auth.max_attempts,
            auth_window: Duration::from_secs(file.auth.attempt_window),
            auth_timeout: Duration::from_secs(file.auth.auth_timeout),
            max_decode_failures: file.limits.max_decode_failures,
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(file.session.idle_timeout),
            ),
            outbox_capacity: file.session.outbox_capacity,
            eviction_timeout: Duration::from_secs(file.session.eviction_timeout),
            sweep_interval: Duration::from_secs(file.session.sweep_interval.max(1)),
        };

        Ok(Self {
            bind: file.server.bind,
            port: cli.port.unwrap_or(file.server.port),
            secret,
            ephemeral_secret,
            token_ttl: file.auth.token_ttl,
            gateway,
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_HEX: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn empty_file_uses_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let cfg = ServerConfig::resolve(file, &CliOverrides::default(), Some(SECRET_HEX)).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.gateway.rate_limit, 50);
        assert_eq!(cfg.gateway.rate_window, Duration::from_secs(60));
        assert_eq!(cfg.gateway.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.secret.len(), 16);
    }

    #[test]
    fn file_sections_are_read() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            max_connections = 10

            [limits]
            messages = 5
            window = 2

            [session]
            idle_timeout = 120
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, &CliOverrides::default(), Some(SECRET_HEX)).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.gateway.max_connections, 10);
        assert_eq!(cfg.gateway.rate_limit, 5);
        assert_eq!(cfg.gateway.rate_window, Duration::from_secs(2));
        assert_eq!(cfg.gateway.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str("[server]\nport = 9000").unwrap();
        let cli = CliOverrides {
            port: Some(7000),
            rate_limit: Some(100),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, &cli, Some(SECRET_HEX)).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.gateway.rate_limit, 100);
    }

    #[test]
    fn env_secret_wins_over_file() {
        let file: ConfigFile = toml::from_str("[auth]\nsecret = \"ffffffffffffffffffffffffffffffff\"").unwrap();
        let cfg = ServerConfig::resolve(file, &CliOverrides::default(), Some(SECRET_HEX)).unwrap();
        assert_eq!(cfg.secret[1], 1);
    }

    #[test]
    fn bad_secret_is_rejected() {
        let file = ConfigFile::default();
        assert!(ServerConfig::resolve(file.clone(), &CliOverrides::default(), Some("xyz")).is_err());
        assert!(ServerConfig::resolve(file, &CliOverrides::default(), Some("abcd")).is_err());
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let cli = CliOverrides {
            rate_limit: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &cli, Some(SECRET_HEX)).is_err());
    }

    #[test]
    fn missing_secret_generates_one() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), &CliOverrides::default(), None).unwrap();
        assert_eq!(cfg.secret.len(), 32);
        assert!(cfg.ephemeral_secret);
    }
}
