//! Section registry.
//!
//! All starts, stops and supersessions go through one lock, held until the
//! previous loop has exited. A section therefore never has two live loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::runner::{LoopStats, QueryLoop};
use super::{StreamError, StreamOptions};
use crate::live::LiveHub;
use crate::storage::{QuerySpec, StoreFacade};

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub accepted: bool,
    pub section_id: String,
    pub run_id: Uuid,
    /// Whether a previous loop for the section was stopped.
    pub replaced: bool,
}

/// Registry view of one running loop.
#[derive(Debug, Clone, Serialize)]
pub struct RunningQueryInfo {
    pub section_id: String,
    pub run_id: Uuid,
    pub query: QuerySpec,
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub published: u64,
    pub empty_ticks: u64,
    pub failed_ticks: u64,
}

struct RunningQuery {
    query: QuerySpec,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    done: JoinHandle<()>,
    stats: Arc<LoopStats>,
}

impl RunningQuery {
    fn info(&self, section_id: &str) -> RunningQueryInfo {
        RunningQueryInfo {
            section_id: section_id.to_owned(),
            run_id: self.run_id,
            query: self.query.clone(),
            started_at: self.started_at,
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            empty_ticks: self.stats.empty.load(Ordering::Relaxed),
            failed_ticks: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

struct ManagerInner {
    facade: StoreFacade,
    hub: LiveHub,
    options: StreamOptions,
    sections: Mutex<HashMap<String, RunningQuery>>,
    root: CancellationToken,
    closed: AtomicBool,
}

/// Owns every section's polling loop.
#[derive(Clone)]
pub struct StreamingQueryManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for StreamingQueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingQueryManager")
            .field("options", &self.inner.options)
            .field(
                "sections",
                &self.inner.sections.try_lock().map(|s| s.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl StreamingQueryManager {
    pub fn new(facade: StoreFacade, hub: LiveHub, options: StreamOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                facade,
                hub,
                options,
                sections: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> StreamOptions {
        self.inner.options
    }

    /// Start polling `query` for `section_id`, replacing any loop already
    /// running for it.
    ///
    /// Returns once the new loop is registered. If the previous loop does not
    /// exit within the stop timeout it is aborted, no new loop is started and
    /// [`StreamError::LifecycleTimeout`] is returned.
    pub async fn start(
        &self,
        section_id: &str,
        query: QuerySpec,
    ) -> Result<StartOutcome, StreamError> {
        let section_id = section_id.trim();
        if section_id.is_empty() {
            return Err(StreamError::InvalidArgument(
                "section_id must not be empty".into(),
            ));
        }
        query
            .validate()
            .map_err(|e| StreamError::InvalidArgument(e.to_string()))?;

        let mut sections = self.inner.sections.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StreamError::ShutDown);
        }

        let replaced = match sections.remove(section_id) {
            Some(previous) => {
                self.retire(section_id, previous).await?;
                true
            }
            None => false,
        };

        let cancel = self.inner.root.child_token();
        let stats = Arc::new(LoopStats::default());
        let run_id = Uuid::new_v4();
        let done = tokio::spawn(
            QueryLoop {
                section_id: section_id.to_owned(),
                query: query.clone(),
                facade: self.inner.facade.clone(),
                hub: self.inner.hub.clone(),
                interval: self.inner.options.interval,
                cancel: cancel.clone(),
                stats: stats.clone(),
            }
            .run(),
        );

        tracing::info!(
            section = section_id,
            %run_id,
            measurements = ?query.measurements,
            time_range = %query.time_range,
            aggregation = %query.aggregation,
            replaced,
            "Query started"
        );

        sections.insert(
            section_id.to_owned(),
            RunningQuery {
                query,
                run_id,
                started_at: Utc::now(),
                cancel,
                done,
                stats,
            },
        );

        Ok(StartOutcome {
            accepted: true,
            section_id: section_id.to_owned(),
            run_id,
            replaced,
        })
    }

    /// Stop the loop for `section_id`. Returns `false` if none was running.
    pub async fn stop(&self, section_id: &str) -> Result<bool, StreamError> {
        let mut sections = self.inner.sections.lock().await;
        let Some(running) = sections.remove(section_id) else {
            return Ok(false);
        };
        self.retire(section_id, running).await?;
        tracing::info!(section = section_id, "Query stopped");
        Ok(true)
    }

    pub async fn lookup(&self, section_id: &str) -> Option<RunningQueryInfo> {
        self.inner
            .sections
            .lock()
            .await
            .get(section_id)
            .map(|running| running.info(section_id))
    }

    /// Running loops ordered by section id.
    pub async fn list(&self) -> Vec<RunningQueryInfo> {
        let sections = self.inner.sections.lock().await;
        let mut infos: Vec<_> = sections
            .iter()
            .map(|(id, running)| running.info(id))
            .collect();
        infos.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        infos
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sections.lock().await.len()
    }

    /// Stop every loop and refuse further starts.
    ///
    /// All loops are stopped even if some time out; the first timeout is
    /// returned.
    pub async fn shutdown(&self) -> Result<(), StreamError> {
        let mut sections = self.inner.sections.lock().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.root.cancel();

        let count = sections.len();
        let mut first_error = None;
        for (section_id, running) in sections.drain() {
            if let Err(e) = self.retire(&section_id, running).await {
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(stopped = count, "Streaming query manager shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel a loop and wait, bounded, for it to exit.
    async fn retire(&self, section_id: &str, mut running: RunningQuery) -> Result<(), StreamError> {
        running.cancel.cancel();
        let waited = self.inner.options.stop_timeout;

        match timeout(waited, &mut running.done).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // A panicked loop has still exited.
                tracing::error!(section = section_id, run_id = %running.run_id, error = %e, "Query loop panicked");
                Ok(())
            }
            Err(_) => {
                running.done.abort();
                tracing::error!(
                    section = section_id,
                    run_id = %running.run_id,
                    waited = ?waited,
                    "Query loop ignored cancellation, aborted"
                );
                Err(StreamError::LifecycleTimeout {
                    section_id: section_id.to_owned(),
                    waited,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveFilter;
    use crate::storage::{Aggregation, Point, StorageBuilder, StorageHandles, TimeRange};
    use std::time::Duration;

    async fn setup() -> (StreamingQueryManager, LiveHub, StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
        let now = Utc::now();
        handles
            .facade
            .write_points(&[
                Point::new("a").with_field("v", 1.0).at(now - chrono::Duration::minutes(10)),
                Point::new("b").with_field("v", 2.0).at(now - chrono::Duration::minutes(10)),
            ])
            .await
            .unwrap();

        let hub = LiveHub::new(64);
        let manager = StreamingQueryManager::new(
            handles.facade.clone(),
            hub.clone(),
            StreamOptions::default().with_interval(Duration::from_millis(100)),
        );
        (manager, hub, handles)
    }

    fn spec(measurement: &str) -> QuerySpec {
        QuerySpec::new([measurement], TimeRange::LastHour, Aggregation::Average)
    }

    #[tokio::test]
    async fn test_start_publishes_and_stop_ends() {
        let (manager, hub, _handles) = setup().await;
        let mut rx = hub.subscribe(LiveFilter::section("s1"));

        let outcome = manager.start("s1", spec("a")).await.unwrap();
        assert!(outcome.accepted);
        assert!(!outcome.replaced);
        assert_eq!(outcome.section_id, "s1");

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload[0]["measurement"], "a");
        assert_eq!(msg.payload[0]["value"], 1.0);

        assert!(manager.stop("s1").await.unwrap());
        assert!(!manager.stop("s1").await.unwrap());
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_supersede_replaces_loop() {
        let (manager, _hub, _handles) = setup().await;
        let first = manager.start("s1", spec("a")).await.unwrap();
        let second = manager.start("s1", spec("b")).await.unwrap();

        assert!(second.replaced);
        assert_ne!(first.run_id, second.run_id);

        let info = manager.lookup("s1").await.unwrap();
        assert_eq!(info.run_id, second.run_id);
        assert_eq!(info.query.measurements, vec!["b"]);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (manager, _hub, _handles) = setup().await;
        assert!(matches!(
            manager.start(" ", spec("a")).await,
            Err(StreamError::InvalidArgument(_))
        ));
        let empty = QuerySpec::new(Vec::<String>::new(), TimeRange::LastHour, Aggregation::Max);
        assert!(matches!(
            manager.start("s1", empty).await,
            Err(StreamError::InvalidArgument(_))
        ));
        assert!(manager.lookup("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_all() {
        let (manager, _hub, _handles) = setup().await;
        manager.start("s2", spec("b")).await.unwrap();
        manager.start("s1", spec("a")).await.unwrap();

        let sections: Vec<_> = manager
            .list()
            .await
            .into_iter()
            .map(|i| i.section_id)
            .collect();
        assert_eq!(sections, vec!["s1", "s2"]);

        manager.shutdown().await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert!(matches!(
            manager.start("s1", spec("a")).await,
            Err(StreamError::ShutDown)
        ));
    }
}
