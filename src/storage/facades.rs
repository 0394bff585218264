//! User-facing storage facades.
//!
//! - `StoreFacade`: the only path to the store; bounded reads and writes, the
//!   catalog cache and connection state
//! - `StorageWriter`: non-blocking writes via MPSC to the writer actor

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::connection::{ConnectionState, StateCell};
use crate::storage::StorageError;
use crate::storage::actor::{Command, WriterStats, WriterStatsSnapshot};
use crate::storage::backend::TimeSeriesStore;
use crate::storage::catalog::{self, Catalog, CatalogCache};
use crate::storage::saved_queries::SAVED_QUERY_MEASUREMENT;
use crate::storage::types::{AggregateQuery, Fields, Point, QueryRow, QuerySpec, Tags};

// =============================================================================
// Constants
// =============================================================================

/// Default bound on store reads.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on store writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Store facade
// =============================================================================

/// Time bounds applied by the facade.
#[derive(Debug, Clone, Copy)]
pub struct FacadeOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Facade over the time-series store.
///
/// Cheap to clone; all clones share one connection, one state and one catalog.
#[derive(Clone)]
pub struct StoreFacade {
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    store: Arc<dyn TimeSeriesStore>,
    state: StateCell,
    catalog: CatalogCache,
    options: FacadeOptions,
}

impl std::fmt::Debug for StoreFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFacade")
            .field("backend", &self.inner.store.name())
            .field("state", &self.inner.state.get())
            .finish_non_exhaustive()
    }
}

impl StoreFacade {
    /// Verify the store answers, then open the facade.
    ///
    /// The catalog is populated once on success; a discovery failure is logged
    /// and leaves the catalog empty.
    pub async fn connect(
        store: Arc<dyn TimeSeriesStore>,
        options: FacadeOptions,
    ) -> Result<Self, StorageError> {
        match tokio::time::timeout(options.read_timeout, store.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(StorageError::Connectivity(e.to_string())),
            Err(_) => {
                return Err(StorageError::Connectivity(format!(
                    "ping timed out after {:?}",
                    options.read_timeout
                )));
            }
        }

        let facade = Self {
            inner: Arc::new(FacadeInner {
                store,
                state: StateCell::new(ConnectionState::Connected),
                catalog: CatalogCache::default(),
                options,
            }),
        };

        if let Err(e) = facade.refresh_catalog().await {
            tracing::warn!(error = %e, "Initial catalog refresh failed");
        }

        tracing::info!(backend = facade.inner.store.name(), "Store facade connected");
        Ok(facade)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        self.ensure_connected()?;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation,
                after: limit,
            }),
        }
    }

    /// Liveness check against the store.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let limit = self.inner.options.read_timeout;
        self.bounded("ping", limit, self.inner.store.ping()).await
    }

    /// Write one point.
    pub async fn write(
        &self,
        measurement: &str,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let point = Point {
            measurement: measurement.to_owned(),
            tags,
            fields,
            timestamp,
        };
        self.write_points(std::slice::from_ref(&point)).await
    }

    /// Write points as a single store call.
    pub async fn write_points(&self, points: &[Point]) -> Result<(), StorageError> {
        self.ensure_connected()?;
        if let Some(point) = points
            .iter()
            .find(|p| p.measurement.is_empty() || p.fields.is_empty())
        {
            return Err(StorageError::InvalidArgument(format!(
                "point for '{}' needs a measurement name and at least one field",
                point.measurement
            )));
        }
        if points.is_empty() {
            return Ok(());
        }

        let limit = self.inner.options.write_timeout;
        self.bounded("write", limit, self.inner.store.write_points(points))
            .await
    }

    /// Run a windowed aggregate over the requested measurements.
    pub async fn query(&self, spec: &QuerySpec) -> Result<Vec<QueryRow>, StorageError> {
        self.ensure_connected()?;
        spec.validate()?;

        let query = AggregateQuery::from_spec(spec, Utc::now());
        tracing::debug!(
            measurements = ?query.measurements,
            time_range = %spec.time_range,
            aggregation = %spec.aggregation,
            "Running aggregate query"
        );

        let limit = self.inner.options.read_timeout;
        self.bounded("query", limit, self.inner.store.aggregate(&query))
            .await
    }

    /// Raw points of one measurement at or after `since`.
    pub async fn scan(
        &self,
        measurement: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, StorageError> {
        let limit = self.inner.options.read_timeout;
        self.bounded("scan", limit, self.inner.store.scan(measurement, since))
            .await
    }

    /// Delete points of `measurement` in `[start, stop)`.
    pub async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let limit = self.inner.options.write_timeout;
        self.bounded(
            "delete",
            limit,
            self.inner.store.delete_range(measurement, start, stop),
        )
        .await
    }

    /// The cached catalog. May be stale.
    pub async fn catalog(&self) -> Arc<Catalog> {
        self.inner.catalog.snapshot().await
    }

    /// Rediscover the catalog and replace the cached snapshot.
    ///
    /// Each discovery call gets the read timeout. A measurement whose tags
    /// time out is cached with no tags rather than failing the refresh.
    pub async fn refresh_catalog(&self) -> Result<Arc<Catalog>, StorageError> {
        self.ensure_connected()?;
        let limit = self.inner.options.read_timeout;
        let catalog =
            catalog::discover(self.inner.store.as_ref(), &[SAVED_QUERY_MEASUREMENT], limit)
                .await?;

        tracing::debug!(
            measurements = catalog.measurements.len(),
            "Catalog refreshed"
        );
        Ok(self.inner.catalog.replace(catalog).await)
    }

    /// Release the store connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.state.swap(ConnectionState::Closed) != ConnectionState::Closed {
            self.inner.store.close().await;
            tracing::info!("Store facade closed");
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Non-blocking storage writer.
///
/// Uses `try_send`: points are dropped and counted when the queue is full.
/// The actor flushes when its buffer reaches the batch size or the flush
/// interval elapses.
#[derive(Clone)]
pub struct StorageWriter {
    tx: mpsc::Sender<Command>,
    stats: Arc<WriterStats>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter").finish_non_exhaustive()
    }
}

impl StorageWriter {
    pub(crate) fn new(tx: mpsc::Sender<Command>, stats: Arc<WriterStats>) -> Self {
        Self { tx, stats }
    }

    /// Queue a point without waiting.
    pub fn submit(&self, point: Point) -> Result<(), StorageError> {
        match self.tx.try_send(Command::Write(point)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Writer queue full, dropping point");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(StorageError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(StorageError::ChannelSend)
            }
        }
    }

    /// Flush buffered points and wait until the actor has written them.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| StorageError::ChannelSend)?;
        done.await.map_err(|_| StorageError::ChannelSend)
    }

    /// Ask the actor to flush and stop.
    pub(crate) async fn shutdown(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(ack))
            .await
            .map_err(|_| StorageError::ChannelSend)?;
        done.await.map_err(|_| StorageError::ChannelSend)
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }
}
