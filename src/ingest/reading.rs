//! Readings and payload decoding.
//!
//! A payload is a JSON object with optional `fields` and `tags` maps. Every
//! scalar field other than `timestamp` becomes its own [`Reading`]; anything
//! else is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::storage::{FieldValue, Fields, Point, Tags};

/// Field holding the source timestamp in epoch seconds.
const TIMESTAMP_FIELD: &str = "timestamp";

/// One normalized sensor data point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn to_point(&self) -> Point {
        Point {
            measurement: self.measurement.clone(),
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl From<Reading> for Point {
    fn from(reading: Reading) -> Self {
        Point {
            measurement: reading.measurement,
            tags: reading.tags,
            fields: reading.fields,
            timestamp: reading.timestamp,
        }
    }
}

/// Why a payload was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("'{0}' must be a JSON object")]
    NotAMap(&'static str),
}

/// Decode one message into readings, one per scalar field.
///
/// `received_at` stamps readings whose payload carries no numeric timestamp.
pub fn decode_message(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Vec<Reading>, DecodeError> {
    let Value::Object(mut root) = serde_json::from_slice(payload)? else {
        return Err(DecodeError::NotAnObject);
    };

    let fields = take_map(&mut root, "fields")?;
    let tags: Tags = take_map(&mut root, "tags")?
        .into_iter()
        .filter_map(|(key, value)| tag_value(value).map(|v| (key, v)))
        .collect();

    let timestamp = fields
        .get(TIMESTAMP_FIELD)
        .and_then(epoch_seconds)
        .unwrap_or(received_at);

    let mut readings = Vec::with_capacity(fields.len());
    for (key, raw) in fields {
        if key == TIMESTAMP_FIELD {
            continue;
        }
        let Some(value) = FieldValue::from_json(&raw) else {
            tracing::warn!(topic, field = %key, "Dropping non-scalar field");
            continue;
        };
        readings.push(Reading {
            measurement: topic.to_owned(),
            tags: tags.clone(),
            fields: [(key, value)].into_iter().collect(),
            timestamp,
        });
    }

    Ok(readings)
}

fn take_map(root: &mut Map<String, Value>, key: &'static str) -> Result<Map<String, Value>, DecodeError> {
    match root.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(DecodeError::NotAMap(key)),
    }
}

fn tag_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Epoch seconds (integer or fractional) as a UTC instant.
fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = value.as_f64().filter(|s| s.is_finite())?;
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}
