//! Configuration module for Sensorium.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (URL, pool, writer queue and batching, timeouts)
//! - Transport settings (broker endpoint, client id, startup topics)
//! - Streaming and live-channel settings

mod app;
mod validation;

pub use app::{
    AppConfig, DatabaseConfig, LiveConfig, ServerConfig, StreamingConfig, TransportConfig,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration, validate_topic_filter};

// Re-export constants
pub use app::{DEFAULT_DATABASE_URL, DEFAULT_ENDPOINT};
