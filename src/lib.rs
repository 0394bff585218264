//! Sensorium - sensor telemetry ingestion and live dashboard streaming.
//!
//! Raw JSON telemetry arrives over a publish/subscribe transport, is normalized
//! into [`Reading`]s, persisted through the [`StoreFacade`] and fanned out to
//! live subscribers. Dashboard sections run cancellable polling loops managed by
//! the [`StreamingQueryManager`], at most one loop per section.
//!
//! # Architecture
//!
//! - **Ingest**: transport connection, subscription set, payload decoding
//! - **Storage**: store facade, catalog cache, saved queries, async writer
//! - **Streaming**: per-section polling loops over the store facade
//! - **Live**: broadcast hub keyed by topic and by section
//! - **Server**: HTTP and WebSocket surface
//!
//! # Example
//!
//! ```rust,ignore
//! use sensorium::{Endpoint, IngestionPipeline, LiveHub, LocalBroker, StorageBuilder};
//!
//! let storage = StorageBuilder::new("sqlite:data/sensorium.db?mode=rwc").build().await?;
//! let hub = LiveHub::new(1024);
//! let pipeline = IngestionPipeline::new(
//!     std::sync::Arc::new(LocalBroker::new()),
//!     storage.writer.clone(),
//!     hub.clone(),
//!     Default::default(),
//! );
//! let conn = pipeline.connect(&Endpoint::new("localhost", 1883)).await?;
//! conn.subscribe("Chicago/+/weather").await?;
//! ```

pub mod config;
pub mod connection;
pub mod ingest;
pub mod live;
pub mod server;
pub mod storage;
pub mod streaming;

pub use connection::{ConnectionState, StateCell};
pub use ingest::{
    ConnectionHandle, DecodeError, Endpoint, IngestError, IngestionPipeline, LocalBroker,
    MqttTransport, PipelineOptions, PipelineStatus, Reading, SubscriptionChange, Transport,
    TransportSession,
};
pub use live::{LiveChannel, LiveFilter, LiveHub, LiveMessage, LiveReceiver};
pub use storage::{
    AggregateQuery, Aggregation, Catalog, FieldValue, Point, QueryRow, QuerySpec, SavedQuery,
    SavedQueryRegistry, StorageBuilder, StorageError, StorageHandles, StorageWriter, StoreFacade,
    TimeRange, TimeSeriesStore,
};
pub use streaming::{RunningQueryInfo, StartOutcome, StreamError, StreamOptions, StreamingQueryManager};
