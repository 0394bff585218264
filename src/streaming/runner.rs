//! Per-section polling loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::live::{LiveChannel, LiveHub};
use crate::storage::{QuerySpec, StoreFacade};

/// Counters shared between a loop and its registry entry.
#[derive(Debug, Default)]
pub(crate) struct LoopStats {
    pub ticks: AtomicU64,
    pub published: AtomicU64,
    pub empty: AtomicU64,
    pub failed: AtomicU64,
}

pub(crate) struct QueryLoop {
    pub section_id: String,
    pub query: QuerySpec,
    pub facade: StoreFacade,
    pub hub: LiveHub,
    pub interval: Duration,
    pub cancel: CancellationToken,
    pub stats: Arc<LoopStats>,
}

impl QueryLoop {
    /// Poll until cancelled.
    ///
    /// Cancellation is observed while waiting on the store and while
    /// sleeping, and is re-checked right before publishing.
    pub(crate) async fn run(self) {
        let channel = LiveChannel::Section(self.section_id.clone());
        tracing::debug!(section = %self.section_id, interval = ?self.interval, "Query loop started");

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.facade.query(&self.query) => result,
            };
            self.stats.ticks.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(rows) if rows.is_empty() => {
                    self.stats.empty.fetch_add(1, Ordering::Relaxed);
                }
                Ok(rows) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    match serde_json::to_value(&rows) {
                        Ok(payload) => {
                            self.hub.publish(channel.clone(), payload);
                            self.stats.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::warn!(section = %self.section_id, error = %e, "Result set not serializable");
                        }
                    }
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(section = %self.section_id, error = %e, "Query tick failed");
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::debug!(
            section = %self.section_id,
            ticks = self.stats.ticks.load(Ordering::Relaxed),
            "Query loop stopped"
        );
    }
}
