//! Catalog of known measurements and their tags.
//!
//! The catalog is advisory: it feeds dashboard pickers and may lag behind the
//! store. Discovery walks measurements, then tag keys, then tag values.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::storage::StorageError;
use crate::storage::backend::TimeSeriesStore;

/// Tag key -> distinct values.
pub type TagValues = BTreeMap<String, BTreeSet<String>>;

/// Snapshot of what exists in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Catalog {
    pub measurements: BTreeSet<String>,
    pub tags_by_measurement: BTreeMap<String, TagValues>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn tags_for(&self, measurement: &str) -> Option<&TagValues> {
        self.tags_by_measurement.get(measurement)
    }
}

/// Walk the store's schema.
///
/// Measurements in `excluded` are skipped, as are tag keys starting with `_`.
/// Every store call is bounded by `limit` on its own. A failure or timeout
/// while reading one measurement's tags leaves that measurement with an empty
/// tag map and the walk carries on.
pub(crate) async fn discover(
    store: &dyn TimeSeriesStore,
    excluded: &[&str],
    limit: Duration,
) -> Result<Catalog, StorageError> {
    let mut catalog = Catalog::default();

    for measurement in bounded("measurements", limit, store.measurements()).await? {
        if excluded.contains(&measurement.as_str()) {
            continue;
        }

        let tags = match discover_tags(store, &measurement, limit).await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(measurement = %measurement, error = %e, "Tag discovery failed");
                TagValues::new()
            }
        };

        catalog.tags_by_measurement.insert(measurement.clone(), tags);
        catalog.measurements.insert(measurement);
    }

    catalog.refreshed_at = Some(Utc::now());
    Ok(catalog)
}

async fn discover_tags(
    store: &dyn TimeSeriesStore,
    measurement: &str,
    limit: Duration,
) -> Result<TagValues, StorageError> {
    let mut tags = TagValues::new();
    for key in bounded("tag_keys", limit, store.tag_keys(measurement)).await? {
        if key.starts_with('_') {
            continue;
        }
        let values = bounded("tag_values", limit, store.tag_values(measurement, &key)).await?;
        tags.insert(key, values.into_iter().collect());
    }
    Ok(tags)
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StorageError::Timeout {
            operation,
            after: limit,
        })?
}

/// Shared, swappable catalog snapshot.
#[derive(Debug, Default)]
pub(crate) struct CatalogCache {
    current: RwLock<Arc<Catalog>>,
}

impl CatalogCache {
    pub(crate) async fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&*self.current.read().await)
    }

    pub(crate) async fn replace(&self, catalog: Catalog) -> Arc<Catalog> {
        let catalog = Arc::new(catalog);
        *self.current.write().await = Arc::clone(&catalog);
        catalog
    }
}
