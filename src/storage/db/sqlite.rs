//! SQLite backend implementation using sqlx.
//!
//! Provides connection pooling and the [`TimeSeriesStore`] operations.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};

use crate::storage::StorageError;
use crate::storage::backend::TimeSeriesStore;
use crate::storage::schema::init_schema;
use crate::storage::types::{AggregateQuery, FieldValue, Point, QueryRow, Tags};

/// Default maximum connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite connection pool wrapper.
///
/// Wraps sqlx's SqlitePool with WAL mode and connection pooling.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Connect to a SQLite database.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL, e.g., `sqlite:data/sensorium.db?mode=rwc`
    /// * `max_connections` - pool size; `0` selects the default
    ///
    /// In-memory databases are private to one connection, so they get a
    /// single connection that is never recycled.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let max_connections = match max_connections {
            0 => DEFAULT_MAX_CONNECTIONS,
            n => n,
        };

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(DEFAULT_CONNECT_TIMEOUT);
        pool_options = if is_memory_url(url) {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        Ok(Self { inner: pool })
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Time-series store backed by a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database and create the schema.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect(url, max_connections).await?;
        init_schema(pool.inner()).await?;
        tracing::debug!(url, "SQLite store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

#[async_trait::async_trait]
impl TimeSeriesStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }

    async fn write_points(&self, points: &[Point]) -> Result<(), StorageError> {
        let mut tx = self.pool.inner().begin().await?;

        for point in points {
            let tags = serde_json::to_string(&point.tags)?;
            let ts = point.timestamp.timestamp_micros();

            for (field, value) in &point.fields {
                let (kind, number, integer, text) = match value {
                    FieldValue::Number(n) => ("float", Some(*n), None, None),
                    FieldValue::Integer(i) => ("int", Some(*i as f64), Some(*i), None),
                    FieldValue::Boolean(b) => ("bool", None, Some(i64::from(*b)), None),
                    FieldValue::Text(s) => ("text", None, None, Some(s.as_str())),
                };
                sqlx::query(
                    "INSERT INTO points (measurement, ts, tags, field, kind, value_num, value_int, value_text) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&point.measurement)
                .bind(ts)
                .bind(&tags)
                .bind(field)
                .bind(kind)
                .bind(number)
                .bind(integer)
                .bind(text)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<QueryRow>, StorageError> {
        let window = query
            .window
            .num_microseconds()
            .filter(|w| *w > 0)
            .ok_or_else(|| StorageError::InvalidArgument("window must be positive".into()))?;

        // Buckets are aligned to the epoch and reported at their end instant.
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT measurement, (ts / {window}) * {window} + {window} AS bucket_end, {}(value_num) AS value \
             FROM points WHERE value_num IS NOT NULL AND ts >= ",
            query.aggregation.as_sql()
        ));
        qb.push_bind(query.start.timestamp_micros());
        qb.push(" AND measurement IN (");
        let mut names = qb.separated(", ");
        for measurement in &query.measurements {
            names.push_bind(measurement);
        }
        names.push_unseparated(") GROUP BY measurement, bucket_end ORDER BY measurement, bucket_end");

        let rows: Vec<(String, i64, f64)> =
            qb.build_query_as().fetch_all(self.pool.inner()).await?;

        Ok(rows
            .into_iter()
            .filter_map(|(measurement, bucket_end, value)| {
                micros_to_utc(bucket_end).map(|timestamp| QueryRow {
                    timestamp,
                    value,
                    measurement,
                })
            })
            .collect())
    }

    async fn scan(
        &self,
        measurement: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, StorageError> {
        type ScanRow = (
            String,
            i64,
            String,
            String,
            String,
            Option<f64>,
            Option<i64>,
            Option<String>,
        );
        let rows: Vec<ScanRow> = sqlx::query_as(
            "SELECT measurement, ts, tags, field, kind, value_num, value_int, value_text FROM points \
             WHERE measurement = ? AND ts >= ? ORDER BY ts, id",
        )
        .bind(measurement)
        .bind(since.timestamp_micros())
        .fetch_all(self.pool.inner())
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for (measurement, ts, tags, field, kind, number, integer, text) in rows {
            let value = match (kind.as_str(), number, integer, text) {
                ("int", _, Some(i), _) => FieldValue::Integer(i),
                ("bool", _, Some(i), _) => FieldValue::Boolean(i != 0),
                (_, Some(n), _, _) => FieldValue::Number(n),
                (_, None, _, Some(s)) => FieldValue::Text(s),
                _ => continue,
            };
            let timestamp = micros_to_utc(ts)
                .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {ts}")))?;
            let tags: Tags = serde_json::from_str(&tags)?;
            points.push(Point {
                measurement,
                tags,
                fields: [(field, value)].into_iter().collect(),
                timestamp,
            });
        }
        Ok(points)
    }

    async fn measurements(&self) -> Result<Vec<String>, StorageError> {
        let names = sqlx::query_scalar("SELECT DISTINCT measurement FROM points ORDER BY measurement")
            .fetch_all(self.pool.inner())
            .await?;
        Ok(names)
    }

    async fn tag_keys(&self, measurement: &str) -> Result<Vec<String>, StorageError> {
        let keys = sqlx::query_scalar(
            "SELECT DISTINCT j.key FROM points, json_each(points.tags) AS j \
             WHERE points.measurement = ? ORDER BY j.key",
        )
        .bind(measurement)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(keys)
    }

    async fn tag_values(
        &self,
        measurement: &str,
        tag_key: &str,
    ) -> Result<Vec<String>, StorageError> {
        let values = sqlx::query_scalar(
            "SELECT DISTINCT CAST(j.value AS TEXT) FROM points, json_each(points.tags) AS j \
             WHERE points.measurement = ? AND j.key = ? ORDER BY 1",
        )
        .bind(measurement)
        .bind(tag_key)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(values)
    }

    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM points WHERE measurement = ? AND ts >= ? AND ts < ?")
            .bind(measurement)
            .bind(start.timestamp_micros())
            .bind(stop.timestamp_micros())
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
