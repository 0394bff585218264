//! Ingestion error types.

use thiserror::Error;

/// Errors returned by the ingestion pipeline and its transports.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Broker unreachable or handshake refused.
    #[error("cannot reach {endpoint}: {reason}")]
    Connectivity { endpoint: String, reason: String },

    /// Operation requires a live connection.
    #[error("transport is not connected")]
    NotConnected,

    /// A connection is already open.
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// The pipeline was shut down and will not reconnect.
    #[error("ingestion pipeline is shut down")]
    ShutDown,

    /// Endpoint string could not be parsed.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Empty or malformed topic.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Transport-level failure after connecting.
    #[error("transport error: {0}")]
    Transport(String),
}
