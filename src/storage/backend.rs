//! Time-series store contract.
//!
//! The facade speaks to the engine only through [`TimeSeriesStore`]. The
//! shipped implementation is [`SqliteStore`](crate::storage::db::SqliteStore).

use chrono::{DateTime, Utc};

use crate::storage::StorageError;
use crate::storage::types::{AggregateQuery, Point, QueryRow};

/// Read/write capabilities a time-series engine must offer.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait::async_trait]
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Write points. A batch either lands completely or not at all.
    async fn write_points(&self, points: &[Point]) -> Result<(), StorageError>;

    /// Windowed aggregate over the numeric fields of the requested measurements.
    ///
    /// Rows are ordered by measurement then time; windows with no data are omitted.
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<QueryRow>, StorageError>;

    /// Raw points of one measurement at or after `since`, oldest first.
    ///
    /// Each returned point carries exactly one field.
    async fn scan(&self, measurement: &str, since: DateTime<Utc>)
    -> Result<Vec<Point>, StorageError>;

    /// Known measurement names.
    async fn measurements(&self) -> Result<Vec<String>, StorageError>;

    /// Tag keys present on a measurement.
    async fn tag_keys(&self, measurement: &str) -> Result<Vec<String>, StorageError>;

    /// Distinct values of one tag on a measurement.
    async fn tag_values(&self, measurement: &str, tag_key: &str)
    -> Result<Vec<String>, StorageError>;

    /// Delete points of `measurement` with `start <= timestamp < stop`.
    ///
    /// Returns the number of stored rows removed.
    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Release the underlying connection.
    async fn close(&self);
}
