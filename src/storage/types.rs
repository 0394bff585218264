//! Storage data types.
//!
//! Defines the point model written to the store, the structured query
//! parameters accepted by the facade, and the rows it returns.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::StorageError;

// =============================================================================
// Points
// =============================================================================

/// Tag set (sorted, unique keys).
pub type Tags = BTreeMap<String, String>;

/// Field set (sorted, unique keys).
pub type Fields = BTreeMap<String, FieldValue>;

/// A field value.
///
/// Integers are kept apart from floats so they survive exactly; both count as
/// numeric for aggregation. Booleans are stored but never aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    /// Extract a scalar from JSON. Objects, arrays and null yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => n.as_f64().filter(|v| v.is_finite()).map(Self::Number),
            },
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Numeric value used by aggregates.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            Self::Boolean(_) | Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A single time-series point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Create a point stamped with the current time.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Tags::new(),
            fields: Fields::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// =============================================================================
// Query parameters
// =============================================================================

/// Relative time range of a dashboard query.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum TimeRange {
    #[serde(rename = "lastHour")]
    #[strum(serialize = "lastHour")]
    LastHour,
    #[serde(rename = "last12Hours")]
    #[strum(serialize = "last12Hours")]
    Last12Hours,
    #[default]
    #[serde(rename = "last24Hours")]
    #[strum(serialize = "last24Hours")]
    Last24Hours,
}

impl TimeRange {
    /// Parse a caller-supplied name, falling back to the default on anything unknown.
    pub fn parse_lenient(name: Option<&str>) -> Self {
        match name {
            Some(name) => name.parse().unwrap_or_else(|_| {
                tracing::debug!(time_range = name, "Unknown time range, using default");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// How far back the range reaches from now.
    pub fn span(&self) -> Duration {
        match self {
            Self::LastHour => Duration::hours(1),
            Self::Last12Hours => Duration::hours(12),
            Self::Last24Hours => Duration::hours(24),
        }
    }

    /// Aggregation window; shorter ranges use finer windows.
    pub fn window(&self) -> Duration {
        match self {
            Self::LastHour => Duration::minutes(5),
            Self::Last12Hours => Duration::minutes(30),
            Self::Last24Hours => Duration::hours(1),
        }
    }
}

/// Aggregate function applied per window.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Aggregation {
    #[default]
    #[serde(alias = "mean")]
    #[strum(to_string = "average", serialize = "mean")]
    Average,
    #[strum(serialize = "max")]
    Max,
    #[strum(serialize = "min")]
    Min,
}

impl Aggregation {
    /// Parse a caller-supplied name, falling back to the default on anything unknown.
    pub fn parse_lenient(name: Option<&str>) -> Self {
        match name {
            Some(name) => name.parse().unwrap_or_else(|_| {
                tracing::debug!(aggregation = name, "Unknown aggregation, using default");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Average => "AVG",
            Self::Max => "MAX",
            Self::Min => "MIN",
        }
    }
}

/// Structured query issued by dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub measurements: Vec<String>,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl QuerySpec {
    pub fn new<I, S>(measurements: I, time_range: TimeRange, aggregation: Aggregation) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            measurements: measurements.into_iter().map(Into::into).collect(),
            time_range,
            aggregation,
        }
    }

    /// Check the measurement list is non-empty and holds no blank names.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_measurements(&self.measurements)
    }
}

pub(crate) fn validate_measurements(measurements: &[String]) -> Result<(), StorageError> {
    if measurements.is_empty() {
        return Err(StorageError::InvalidArgument(
            "measurements must be a non-empty list".to_string(),
        ));
    }
    if measurements.iter().any(|m| m.trim().is_empty()) {
        return Err(StorageError::InvalidArgument(
            "measurement names must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Read a flat list of measurement names from untyped JSON.
///
/// Nested lists and non-string entries are rejected.
pub fn measurements_from_json(value: &Value) -> Result<Vec<String>, StorageError> {
    let Value::Array(items) = value else {
        return Err(StorageError::InvalidArgument(
            "measurements must be a list of names".to_string(),
        ));
    };

    let names = items
        .iter()
        .map(|item| match item {
            Value::String(name) => Ok(name.clone()),
            other => Err(StorageError::InvalidArgument(format!(
                "measurements must be a flat list of names, found {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    validate_measurements(&names)?;
    Ok(names)
}

/// Store-level aggregate query derived from a [`QuerySpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub measurements: Vec<String>,
    pub start: DateTime<Utc>,
    pub window: Duration,
    pub aggregation: Aggregation,
}

impl AggregateQuery {
    /// Resolve the relative range against `now`.
    pub fn from_spec(spec: &QuerySpec, now: DateTime<Utc>) -> Self {
        Self {
            measurements: spec.measurements.clone(),
            start: now - spec.time_range.span(),
            window: spec.time_range.window(),
            aggregation: spec.aggregation,
        }
    }
}

/// One aggregated result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub measurement: String,
}
