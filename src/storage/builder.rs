//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::storage::actor::{DEFAULT_BATCH_FLUSH_INTERVAL, DEFAULT_BATCH_SIZE, WriteActor};
use crate::storage::backend::TimeSeriesStore;
use crate::storage::db::SqliteStore;
use crate::storage::facades::{DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, FacadeOptions};
use crate::storage::{SavedQueryRegistry, StorageError, StorageWriter, StoreFacade};

/// Default channel capacity for writer commands.
///
/// With batch flushing every 500 points or 1 second this absorbs roughly
/// 20 seconds of traffic at 500 readings/sec.
const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Minimum connection pool size.
const MIN_POOL_SIZE: u32 = 2;

/// Maximum connection pool size.
const MAX_POOL_SIZE: u32 = 32;

/// Calculate default pool size based on available CPU parallelism.
///
/// Returns the number of available CPUs, clamped between MIN_POOL_SIZE and MAX_POOL_SIZE.
fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|p| (p.get() as u32).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
        .unwrap_or(4)
}

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    pool_size: u32,
    channel_capacity: usize,
    batch_size: usize,
    batch_flush_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl StorageBuilder {
    /// Create a new storage builder for a SQLite URL.
    ///
    /// Pool size defaults to the number of available CPUs (clamped to 2-32).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: default_pool_size(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: DEFAULT_BATCH_FLUSH_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Set the connection pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the channel capacity for writer commands.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the batch size for point buffering.
    ///
    /// The actor flushes buffered points when this threshold is reached.
    /// Default: 500 points.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the batch flush interval for point buffering.
    ///
    /// The actor flushes buffered points after this duration, even if the
    /// batch size threshold hasn't been reached. Default: 1 second.
    pub fn batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval = interval;
        self
    }

    /// Bound on every store read.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Bound on every store write.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Open the SQLite store and build the storage layer.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        // Create parent directory if it doesn't exist
        if let Some(path) = sqlite_file_path(&self.url)
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let store = SqliteStore::open(&self.url, self.pool_size)
            .await
            .map_err(|e| StorageError::Connectivity(format!("{}: {}", self.url, e)))?;

        self.build_with_store(Arc::new(store)).await
    }

    /// Build the storage layer over an already opened store.
    pub async fn build_with_store(
        self,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Result<StorageHandles, StorageError> {
        let options = FacadeOptions {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };
        let facade = StoreFacade::connect(store, options).await?;

        let (actor_handle, writer) = WriteActor::spawn(
            facade.clone(),
            self.channel_capacity,
            self.batch_size,
            self.batch_flush_interval,
        );

        Ok(StorageHandles {
            saved_queries: SavedQueryRegistry::new(facade.clone()),
            facade,
            writer,
            actor_handle: Some(actor_handle),
        })
    }
}

/// Filesystem path of a file-backed SQLite URL.
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Facade over the store.
    pub facade: StoreFacade,
    /// Non-blocking writer feeding the write actor.
    pub writer: StorageWriter,
    /// Saved query CRUD.
    pub saved_queries: SavedQueryRegistry,
    /// Internal actor handle for graceful shutdown.
    actor_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles")
            .field("facade", &self.facade)
            .finish_non_exhaustive()
    }
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Drains the writer actor, waits for it to finish, then closes the store.
    pub async fn shutdown(mut self) -> Result<(), StorageError> {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "Write actor already stopped");
        }

        if let Some(handle) = self.actor_handle.take() {
            handle
                .await
                .map_err(|e| StorageError::Internal(format!("Failed to join write actor: {e}")))?;
        }

        self.facade.close().await;
        Ok(())
    }
}
