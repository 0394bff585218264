//! Configuration parsing helpers: env expansion, durations, topic filters.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// `${VAR}` without a default names an unset variable.
    #[error("environment variable '{0}' is not set and has no default")]
    UnresolvedVar(String),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("env reference pattern")
});

/// Parse a human-readable duration (`250ms`, `5s`, `1m30s`).
///
/// Used as a clap `value_parser`, hence the `String` error.
///
/// ```
/// use sensorium::config::parse_duration;
///
/// assert_eq!(parse_duration("250ms").unwrap().as_millis(), 250);
/// assert_eq!(parse_duration("1m30s").unwrap().as_secs(), 90);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    match s.trim() {
        "" => Err("duration string is empty".to_string()),
        s => humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}")),
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// A bare `${VAR}` whose variable is unset is an error, so a forgotten
/// broker or database variable fails at startup instead of yielding an
/// empty string.
pub fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_REF.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(3)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_owned(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| name.to_owned());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::UnresolvedVar(name)),
        None => Ok(expanded.into_owned()),
    }
}

/// Check an MQTT topic filter.
///
/// Levels are `/`-separated. `+` must occupy a whole level and `#` must be the
/// whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ConfigError> {
    let invalid = |why: &str| ConfigError::ValidationError(format!("topic '{filter}': {why}"));

    if filter.trim().is_empty() {
        return Err(invalid("must not be blank"));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" if i + 1 == levels.len() => {}
            "#" => return Err(invalid("'#' is only allowed as the last level")),
            l if l.contains(['+', '#']) => {
                return Err(invalid("wildcards must occupy a whole level"));
            }
            _ => {}
        }
    }
    Ok(())
}
