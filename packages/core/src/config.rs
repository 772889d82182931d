//! Runtime bridge configuration
//!
//! `BridgeConfig` is the single source of truth for what the running bridge
//! uses. It is read from the environment once at startup and is immutable
//! for the process lifetime.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PORT: &str = "TREELISTY_MCP_PORT";
pub const ENV_HOST: &str = "TREELISTY_MCP_HOST";
pub const ENV_TOKEN: &str = "TREELISTY_MCP_TOKEN";
pub const ENV_DEBUG: &str = "TREELISTY_MCP_DEBUG";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "TREELISTY_MCP_REQUEST_TIMEOUT_MS";
pub const ENV_BULK_TIMEOUT_MS: &str = "TREELISTY_MCP_BULK_TIMEOUT_MS";
pub const ENV_HEARTBEAT_MS: &str = "TREELISTY_MCP_HEARTBEAT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "TREELISTY_MCP_HANDSHAKE_TIMEOUT_MS";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the auth token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Freshly generated at startup (the normal case)
    Generated,
    /// Fixed via `TREELISTY_MCP_TOKEN`; weakens the random-token model
    Environment,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the WebSocket listener binds to
    pub host: IpAddr,

    /// Port for the WebSocket listener; 0 lets the OS pick one
    pub port: u16,

    /// Shared secret every peer must present at handshake
    pub token: String,

    pub token_source: TokenSource,

    /// Verbose logging toggle
    pub debug: bool,

    /// Deadline for reads and single-node writes
    pub request_timeout: Duration,

    /// Deadline for imports and transaction commit/rollback
    pub bulk_timeout: Duration,

    /// Interval between heartbeat pings; a peer missing one full interval is dead
    pub heartbeat_interval: Duration,

    /// How long a fresh socket has to present its handshake
    pub handshake_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            token: generate_token(),
            token_source: TokenSource::Generated,
            debug: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    ///
    /// Split out from [`BridgeConfig::from_env`] so tests never have to
    /// mutate the real process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = BridgeConfig::default();

        if let Some(value) = non_empty(lookup(ENV_HOST)) {
            config.host = value.parse().map_err(|e| ConfigError::InvalidValue {
                var: ENV_HOST,
                value: value.clone(),
                reason: format!("{}", e),
            })?;
        }

        if let Some(value) = non_empty(lookup(ENV_PORT)) {
            config.port = value.parse().map_err(|e| ConfigError::InvalidValue {
                var: ENV_PORT,
                value: value.clone(),
                reason: format!("{}", e),
            })?;
        }

        if let Some(token) = non_empty(lookup(ENV_TOKEN)) {
            config.token = token;
            config.token_source = TokenSource::Environment;
        }

        if let Some(value) = non_empty(lookup(ENV_DEBUG)) {
            config.debug = parse_flag(&value);
        }

        if let Some(d) = parse_millis(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout = d;
        }
        if let Some(d) = parse_millis(&lookup, ENV_BULK_TIMEOUT_MS)? {
            config.bulk_timeout = d;
        }
        if let Some(d) = parse_millis(&lookup, ENV_HEARTBEAT_MS)? {
            config.heartbeat_interval = d;
        }
        if let Some(d) = parse_millis(&lookup, ENV_HANDSHAKE_TIMEOUT_MS)? {
            config.handshake_timeout = d;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("token cannot be empty".to_string()));
        }

        let durations = [
            ("request_timeout", self.request_timeout),
            ("bulk_timeout", self.bulk_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Generate a fresh authentication token
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(var)) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value: value.clone(),
                reason: format!("{}", e),
            }),
    }
}
