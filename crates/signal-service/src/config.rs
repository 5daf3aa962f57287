//! Signal Service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default signal API bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default signal time-to-live in milliseconds.
pub const DEFAULT_TTL_MS: i64 = 60_000;

/// Default expiry sweep interval in seconds.
pub const DEFAULT_EXPIRY_INTERVAL_SECONDS: u64 = 60;

/// Default presence window in milliseconds.
pub const DEFAULT_PRESENCE_WINDOW_MS: i64 = 30_000;

/// Default capacity of the push fan-out channel.
pub const DEFAULT_HUB_CAPACITY: usize = 1024;

/// Storage backend for signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(ConfigError::InvalidValue(format!(
                "SIGNAL_STORE_BACKEND must be 'memory' or 'redis', got '{other}'"
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Signal Service configuration.
#[derive(Clone)]
pub struct Config {
    /// Signal API bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health/metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Which storage backend to use (default: memory).
    pub store_backend: StoreBackend,

    /// Redis connection URL, required for the Redis backend.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// Signal TTL in milliseconds (default: 60000).
    pub ttl_ms: i64,

    /// Expiry sweep interval in seconds (default: 60).
    pub expiry_interval_seconds: u64,

    /// Window within which a heartbeat keeps a member live (default: 30000).
    pub presence_window_ms: i64,

    /// Push fan-out channel capacity (default: 1024).
    pub hub_capacity: usize,

    /// Log output format (default: text).
    pub log_format: LogFormat,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("store_backend", &self.store_backend)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ttl_ms", &self.ttl_ms)
            .field("expiry_interval_seconds", &self.expiry_interval_seconds)
            .field("presence_window_ms", &self.presence_window_ms)
            .field("hub_capacity", &self.hub_capacity)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value fails to parse or a required variable is missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value fails to parse or a required variable is missing.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SIGNAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SIGNAL_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let store_backend = match vars.get("SIGNAL_STORE_BACKEND") {
            Some(value) => value.parse()?,
            None => StoreBackend::Memory,
        };

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let ttl_ms = parse_var(vars, "SIGNAL_TTL_MS", DEFAULT_TTL_MS)?;
        if ttl_ms <= 0 {
            return Err(ConfigError::InvalidValue(format!(
                "SIGNAL_TTL_MS must be positive, got {ttl_ms}"
            )));
        }

        let expiry_interval_seconds = parse_var(
            vars,
            "SIGNAL_EXPIRY_INTERVAL_SECONDS",
            DEFAULT_EXPIRY_INTERVAL_SECONDS,
        )?;
        if expiry_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SIGNAL_EXPIRY_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let presence_window_ms =
            parse_var(vars, "SIGNAL_PRESENCE_WINDOW_MS", DEFAULT_PRESENCE_WINDOW_MS)?;

        let hub_capacity = parse_var(vars, "SIGNAL_HUB_CAPACITY", DEFAULT_HUB_CAPACITY)?;
        if hub_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SIGNAL_HUB_CAPACITY must be at least 1".to_string(),
            ));
        }

        let log_format = match vars.get("SIGNAL_LOG_FORMAT").map(String::as_str) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            store_backend,
            redis_url,
            ttl_ms,
            expiry_interval_seconds,
            presence_window_ms,
            hub_capacity,
            log_format,
        })
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}
