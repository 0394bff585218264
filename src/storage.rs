//! Storage Layer
//!
//! The store facade is the only component that talks to the time-series
//! store. Writes from ingestion go through an asynchronous writer actor so a
//! slow store never stalls message delivery.
//!
//! # Components
//!
//! - [`StoreFacade`]: bounded reads/writes, aggregate queries, catalog cache, close
//! - [`StorageWriter`]: non-blocking write queue feeding the writer actor
//! - [`SavedQueryRegistry`]: saved query CRUD with wipe-then-rewrite deletion
//! - [`TimeSeriesStore`]: the store contract; [`db::SqliteStore`] implements it
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle management

mod actor;
mod backend;
mod builder;
mod catalog;
pub mod db;
mod error;
mod facades;
pub mod saved_queries;
mod schema;
mod types;

pub use actor::{DEFAULT_BATCH_FLUSH_INTERVAL, DEFAULT_BATCH_SIZE, WriterStatsSnapshot};
pub use backend::TimeSeriesStore;
pub use builder::{StorageBuilder, StorageHandles};
pub use catalog::{Catalog, TagValues};
pub use error::StorageError;
pub use facades::{
    DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, FacadeOptions, StorageWriter, StoreFacade,
};
pub use saved_queries::{SAVED_QUERY_MEASUREMENT, SavedQuery, SavedQueryRegistry};
pub use types::{
    AggregateQuery, Aggregation, FieldValue, Fields, Point, QueryRow, QuerySpec, Tags, TimeRange,
    measurements_from_json,
};
