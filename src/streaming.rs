//! Streaming query manager.
//!
//! Runs one cancellable polling loop per dashboard section. Each loop reads
//! an aggregate through the [`StoreFacade`](crate::storage::StoreFacade) on a
//! fixed interval and publishes non-empty result sets to the section's live
//! channel. Starting a query for a section that already has a loop stops the
//! old loop first, so a section never has two producers.

mod registry;
mod runner;

use std::time::Duration;

use thiserror::Error;

pub use registry::{RunningQueryInfo, StartOutcome, StreamingQueryManager};

/// Default delay between ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest accepted delay between ticks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on waiting for a cancelled loop to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by the streaming query manager.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Bad section id or query.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cancelled loop did not exit in time and was aborted.
    #[error("query loop for section '{section_id}' did not stop within {waited:?}")]
    LifecycleTimeout { section_id: String, waited: Duration },

    /// The manager has been shut down.
    #[error("streaming query manager is shut down")]
    ShutDown,
}

/// Loop timing.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl StreamOptions {
    /// Set the poll interval, clamped to [`MIN_POLL_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_POLL_INTERVAL {
            tracing::warn!(
                requested = ?interval,
                min = ?MIN_POLL_INTERVAL,
                "Poll interval below minimum, clamping"
            );
            self.interval = MIN_POLL_INTERVAL;
        } else {
            self.interval = interval;
        }
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}
