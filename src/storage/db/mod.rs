//! Database backends for the time-series store contract.
//!
//! Currently supports SQLite through sqlx.
//!
//! # Example
//!
//! ```ignore
//! let store = SqliteStore::open("sqlite:data/sensorium.db?mode=rwc", 4).await?;
//! store.ping().await?;
//! ```

mod sqlite;

pub use sqlite::{SqlitePool, SqliteStore};
