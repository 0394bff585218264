//! Writer actor with an MPSC channel.
//!
//! Single-writer pattern: one task drains the channel and writes through the
//! store facade. Points are buffered and flushed when the buffer reaches the
//! batch size or the flush interval elapses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::storage::facades::{StorageWriter, StoreFacade};
use crate::storage::types::Point;

// =============================================================================
// Constants
// =============================================================================

/// Default maximum points in buffer before flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default maximum time before buffer flush.
pub const DEFAULT_BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the writer actor.
#[derive(Debug)]
pub(crate) enum Command {
    /// Buffer a point for the next batch.
    Write(Point),
    /// Flush buffered points, then acknowledge.
    Flush(oneshot::Sender<()>),
    /// Flush and stop.
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Stats
// =============================================================================

/// Counters shared between the actor and its writers.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    pub(crate) dropped: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) failed: AtomicU64,
}

/// Point-in-time copy of writer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterStatsSnapshot {
    /// Points dropped because the queue was full.
    pub dropped: u64,
    /// Points persisted.
    pub written: u64,
    /// Points the store rejected.
    pub failed: u64,
}

impl WriterStats {
    pub(crate) fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Buffer for batch writes with time-based and size-based flushing.
struct BatchBuffer<T> {
    items: Vec<T>,
    first_at: Instant,
}

impl<T> BatchBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            first_at: Instant::now(),
        }
    }

    fn push(&mut self, item: T) {
        // Start the flush clock on the first item so an idle buffer is never overdue
        if self.items.is_empty() {
            self.first_at = Instant::now();
        }
        self.items.push(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn deadline(&self, interval: Duration) -> Option<Instant> {
        (!self.items.is_empty()).then(|| self.first_at + interval)
    }

    fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Store writer actor with batch buffering.
pub(crate) struct WriteActor {
    facade: StoreFacade,
    rx: mpsc::Receiver<Command>,
    buffer: BatchBuffer<Point>,
    batch_size: usize,
    flush_interval: Duration,
    stats: Arc<WriterStats>,
}

impl WriteActor {
    /// Spawn the writer task, returning its handle and a writer facade.
    pub(crate) fn spawn(
        facade: StoreFacade,
        channel_capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (JoinHandle<()>, StorageWriter) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let stats = Arc::new(WriterStats::default());
        let batch_size = batch_size.max(1);

        let actor = WriteActor {
            facade,
            rx,
            buffer: BatchBuffer::new(batch_size),
            batch_size,
            flush_interval,
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(actor.run());

        (handle, StorageWriter::new(tx, stats))
    }

    async fn run(mut self) {
        tracing::info!("Write actor started");

        loop {
            let command = match self.buffer.deadline(self.flush_interval) {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        // Flush interval elapsed
                        self.flush().await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            match command {
                Some(Command::Write(point)) => {
                    self.buffer.push(point);
                    if self.buffer.len() >= self.batch_size {
                        self.flush().await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    self.flush().await;
                    let _ = ack.send(());
                }
                Some(Command::Shutdown(ack)) => {
                    tracing::info!("Write actor shutting down");
                    self.flush().await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    tracing::debug!("All writers dropped, shutting down");
                    self.flush().await;
                    break;
                }
            }
        }

        tracing::info!("Write actor stopped");
    }

    /// Write the buffer as one batch. If the store rejects the batch, retry
    /// point by point so a single bad point does not take its neighbours down
    /// with it. An unavailable store fails the whole batch at once.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let points = self.buffer.take();

        match self.facade.write_points(&points).await {
            Ok(()) => {
                self.stats
                    .written
                    .fetch_add(points.len() as u64, Ordering::Relaxed);
            }
            Err(e) if e.is_unavailable() => {
                self.stats
                    .failed
                    .fetch_add(points.len() as u64, Ordering::Relaxed);
                tracing::warn!(error = %e, count = points.len(), "Store unavailable, batch dropped");
            }
            Err(e) if points.len() > 1 => {
                tracing::warn!(error = %e, count = points.len(), "Batch write failed, retrying points individually");
                for point in &points {
                    match self.facade.write_points(std::slice::from_ref(point)).await {
                        Ok(()) => {
                            self.stats.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(measurement = %point.measurement, error = %e, "Point write failed");
                        }
                    }
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(measurement = %points[0].measurement, error = %e, "Point write failed");
            }
        }
    }
}
