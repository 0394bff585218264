//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::Endpoint;
use crate::live::DEFAULT_LIVE_CAPACITY;
use crate::storage::{
    DEFAULT_BATCH_FLUSH_INTERVAL, DEFAULT_BATCH_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::streaming::{DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT, MIN_POLL_INTERVAL};

use super::validation::{ConfigError, expand_env_vars, validate_topic_filter};

// =============================================================================
// Constants
// =============================================================================

/// Default database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/sensorium.db?mode=rwc";

/// Default broker endpoint.
pub const DEFAULT_ENDPOINT: &str = "mqtt://127.0.0.1:1883";

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default MQTT client id.
pub const DEFAULT_CLIENT_ID: &str = "sensorium";

/// Default transport connect budget.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default MQTT keep-alive.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    pub url: String,

    /// Connection pool size (default: 4).
    pub pool_size: u32,

    /// Writer queue capacity (default: 10000).
    pub channel_capacity: usize,

    /// Points per batch write (default: 500).
    pub batch_size: usize,

    /// Maximum time a partial batch waits (default: 1s).
    #[serde(with = "humantime_serde")]
    pub batch_flush_interval: Duration,

    /// Bound on each store read (default: 10s).
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Bound on each store write (default: 5s).
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: DEFAULT_BATCH_FLUSH_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Broker endpoint, `mqtt://host:port`.
    pub endpoint: String,

    /// MQTT client id (default: "sensorium").
    pub client_id: String,

    /// Budget for probe plus handshake (default: 5s).
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// MQTT keep-alive (default: 60s).
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Topics subscribed on startup.
    pub topics: Vec<String>,

    /// Connect on startup (default: true).
    pub auto_connect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            topics: Vec::new(),
            auto_connect: true,
        }
    }
}

impl TransportConfig {
    /// Parsed broker endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.endpoint.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid transport endpoint: '{}'",
                self.endpoint
            ))
        })
    }
}

// =============================================================================
// Streaming and Live Configuration
// =============================================================================

/// Query loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Delay between ticks (default: 5s, minimum: 100ms).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Bound on waiting for a cancelled loop (default: 5s).
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Live channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Messages buffered per receiver (default: 1024).
    pub capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LIVE_CAPACITY,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub streaming: StreamingConfig,
    pub live: LiveConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server bind address
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        // Validate server port
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database url must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("pool_size", self.database.pool_size as usize),
            ("channel_capacity", self.database.channel_capacity),
            ("batch_size", self.database.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "database {name} must be positive"
                )));
            }
        }

        self.transport.endpoint()?;
        if self.transport.client_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "transport client_id must not be empty".to_string(),
            ));
        }
        for topic in &self.transport.topics {
            validate_topic_filter(topic)?;
        }

        if self.streaming.interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "streaming interval must be at least {}",
                humantime::format_duration(MIN_POLL_INTERVAL)
            )));
        }
        if self.streaming.stop_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "streaming stop_timeout must be positive".to_string(),
            ));
        }

        if self.live.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "live capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
