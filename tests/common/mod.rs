//! Shared test fixtures.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensorium::storage::db::SqliteStore;
use sensorium::{AggregateQuery, Point, QueryRow, StorageBuilder, StorageError, StorageHandles, TimeSeriesStore};

/// Where a stalled delete waits relative to applying it.
#[derive(Debug, Clone, Copy)]
pub enum DeleteStall {
    /// Wait first; a caller that gives up leaves the rows in place.
    BeforeApply(Duration),
    /// Apply, then wait; a caller that gives up never hears of the delete.
    AfterApply(Duration),
}

/// SQLite store with injectable failures and stalls.
pub struct ControlledStore {
    inner: SqliteStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stall_next_read: Mutex<Option<Duration>>,
    stall_writes: Mutex<Option<Duration>>,
    write_calls: AtomicU64,
    fail_tags_for: Mutex<HashSet<String>>,
    stall_tags_for: Mutex<HashMap<String, Duration>>,
    stall_next_delete: Mutex<Option<DeleteStall>>,
}

impl ControlledStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open("sqlite::memory:", 1).await.unwrap(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            stall_next_read: Mutex::new(None),
            stall_writes: Mutex::new(None),
            write_calls: AtomicU64::new(0),
            fail_tags_for: Mutex::new(HashSet::new()),
            stall_tags_for: Mutex::new(HashMap::new()),
            stall_next_delete: Mutex::new(None),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Block the thread (ignoring cancellation) on the next aggregate call.
    pub fn stall_next_read(&self, duration: Duration) {
        *self.stall_next_read.lock().unwrap() = Some(duration);
    }

    /// Make every write wait before touching the database. `None` clears it.
    pub fn stall_writes(&self, duration: Option<Duration>) {
        *self.stall_writes.lock().unwrap() = duration;
    }

    /// Number of `write_points` calls received.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Fail tag discovery for one measurement.
    pub fn fail_tags_for(&self, measurement: &str) {
        self.fail_tags_for.lock().unwrap().insert(measurement.to_owned());
    }

    /// Make tag discovery for one measurement wait.
    pub fn stall_tags_for(&self, measurement: &str, duration: Duration) {
        self.stall_tags_for
            .lock()
            .unwrap()
            .insert(measurement.to_owned(), duration);
    }

    pub fn stall_next_delete(&self, stall: DeleteStall) {
        *self.stall_next_delete.lock().unwrap() = Some(stall);
    }

    async fn tag_gate(&self, measurement: &str) -> Result<(), StorageError> {
        let stall = self.stall_tags_for.lock().unwrap().get(measurement).copied();
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        if self.fail_tags_for.lock().unwrap().contains(measurement) {
            return Err(StorageError::Internal(format!(
                "injected tag failure for {measurement}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesStore for ControlledStore {
    fn name(&self) -> &str {
        "controlled-sqlite"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }

    async fn write_points(&self, points: &[Point]) -> Result<(), StorageError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall_writes.lock().unwrap();
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Internal("injected write failure".into()));
        }
        self.inner.write_points(points).await
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<QueryRow>, StorageError> {
        let stall = self.stall_next_read.lock().unwrap().take();
        if let Some(duration) = stall {
            std::thread::sleep(duration);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Internal("injected read failure".into()));
        }
        self.inner.aggregate(query).await
    }

    async fn scan(
        &self,
        measurement: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, StorageError> {
        self.inner.scan(measurement, since).await
    }

    async fn measurements(&self) -> Result<Vec<String>, StorageError> {
        self.inner.measurements().await
    }

    async fn tag_keys(&self, measurement: &str) -> Result<Vec<String>, StorageError> {
        self.tag_gate(measurement).await?;
        self.inner.tag_keys(measurement).await
    }

    async fn tag_values(
        &self,
        measurement: &str,
        tag_key: &str,
    ) -> Result<Vec<String>, StorageError> {
        self.tag_gate(measurement).await?;
        self.inner.tag_values(measurement, tag_key).await
    }

    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let stall = self.stall_next_delete.lock().unwrap().take();
        match stall {
            Some(DeleteStall::BeforeApply(duration)) => {
                tokio::time::sleep(duration).await;
                self.inner.delete_range(measurement, start, stop).await
            }
            Some(DeleteStall::AfterApply(duration)) => {
                let deleted = self.inner.delete_range(measurement, start, stop).await?;
                tokio::time::sleep(duration).await;
                Ok(deleted)
            }
            None => self.inner.delete_range(measurement, start, stop).await,
        }
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Storage layer over a fresh controlled store.
pub async fn controlled_storage() -> (Arc<ControlledStore>, StorageHandles) {
    controlled_storage_with(|builder| builder).await
}

/// Like [`controlled_storage`], with extra builder settings.
pub async fn controlled_storage_with(
    configure: impl FnOnce(StorageBuilder) -> StorageBuilder,
) -> (Arc<ControlledStore>, StorageHandles) {
    let store = ControlledStore::new().await;
    let builder = StorageBuilder::new("sqlite::memory:").batch_flush_interval(Duration::from_millis(50));
    let handles = configure(builder)
        .build_with_store(store.clone())
        .await
        .unwrap();
    (store, handles)
}

/// Storage layer over plain in-memory SQLite.
pub async fn memory_storage() -> StorageHandles {
    StorageBuilder::new("sqlite::memory:")
        .batch_flush_interval(Duration::from_millis(50))
        .build()
        .await
        .unwrap()
}
