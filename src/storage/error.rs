//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (connectivity, argument, store
//! operation, partial rewrite, etc.).

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached while connecting.
    #[error("store unreachable: {0}")]
    Connectivity(String),

    /// Operation attempted before connecting or after close.
    #[error("store connection is not open")]
    NotConnected,

    /// Malformed query or write parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Named record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store call exceeded its time bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The wipe of a rewrite succeeded but the rewrite did not.
    ///
    /// The records named in `at_risk` are no longer persisted.
    #[error("partial write after wipe, {} record(s) at risk: {reason}", at_risk.len())]
    PartialWrite {
        at_risk: Vec<String>,
        reason: String,
    },

    /// Writer queue is full; the item was dropped.
    #[error("writer queue is full")]
    ChannelFull,

    /// Failed to send command to writer actor.
    #[error("failed to send command to writer actor")]
    ChannelSend,

    /// Internal error (e.g., task join failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in the store (e.g., unreadable saved record).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Whether this is a failure of an established store connection.
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Json(_) | Self::Timeout { .. } | Self::InvalidData(_)
        )
    }

    /// Whether the store itself is unreachable or too slow, as opposed to
    /// rejecting the data.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NotConnected | Self::Connectivity(_)
        )
    }
}
