//! Saved query registry.
//!
//! Named measurement lists persisted as ordinary rows in a reserved
//! measurement. Deletion wipes the namespace and rewrites the survivors; a
//! registry-wide lock keeps readers from observing the gap in between.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::storage::StorageError;
use crate::storage::facades::StoreFacade;
use crate::storage::types::{
    Aggregation, FieldValue, Point, QueryRow, QuerySpec, TimeRange, validate_measurements,
};

// =============================================================================
// Constants
// =============================================================================

/// Reserved measurement holding saved queries.
pub const SAVED_QUERY_MEASUREMENT: &str = "user_queries";

/// Tag carrying the query name.
const QUERY_NAME_TAG: &str = "query_name";

/// Text field carrying the JSON-encoded measurement list.
const MEASUREMENTS_FIELD: &str = "measurements";

/// Exclusive upper bound of the wipe (2200-01-01T00:00:00Z).
const WIPE_UPPER_BOUND_SECS: i64 = 7_258_118_400;

// =============================================================================
// Types
// =============================================================================

/// A named, re-runnable measurement list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedQuery {
    pub query_name: String,
    pub measurements: Vec<String>,
}

impl SavedQuery {
    fn to_point(&self, timestamp: DateTime<Utc>) -> Result<Point, StorageError> {
        Ok(Point::new(SAVED_QUERY_MEASUREMENT)
            .with_tag(QUERY_NAME_TAG, self.query_name.as_str())
            .with_field(MEASUREMENTS_FIELD, serde_json::to_string(&self.measurements)?)
            .at(timestamp))
    }

    fn from_point(point: &Point) -> Result<Self, StorageError> {
        let query_name = point
            .tags
            .get(QUERY_NAME_TAG)
            .ok_or_else(|| StorageError::InvalidData("saved query row without a name".into()))?;
        let encoded = point
            .fields
            .get(MEASUREMENTS_FIELD)
            .and_then(FieldValue::as_str)
            .ok_or_else(|| {
                StorageError::InvalidData(format!("saved query '{query_name}' has no measurements"))
            })?;

        Ok(Self {
            query_name: query_name.clone(),
            measurements: serde_json::from_str(encoded)?,
        })
    }
}

fn partial_write(at_risk: Vec<String>, cause: &StorageError) -> StorageError {
    tracing::error!(
        error = %cause,
        at_risk = ?at_risk,
        "Saved query rewrite failed after wipe"
    );
    StorageError::PartialWrite {
        at_risk,
        reason: cause.to_string(),
    }
}

// =============================================================================
// Registry
// =============================================================================

/// CRUD over saved queries.
#[derive(Clone)]
pub struct SavedQueryRegistry {
    facade: StoreFacade,
    lock: Arc<RwLock<()>>,
}

impl std::fmt::Debug for SavedQueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedQueryRegistry").finish_non_exhaustive()
    }
}

impl SavedQueryRegistry {
    pub fn new(facade: StoreFacade) -> Self {
        Self {
            facade,
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Save or replace a query.
    pub async fn save(
        &self,
        name: &str,
        measurements: Vec<String>,
    ) -> Result<SavedQuery, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "query_name must not be empty".to_string(),
            ));
        }
        validate_measurements(&measurements)?;

        let query = SavedQuery {
            query_name: name.to_owned(),
            measurements,
        };

        let _guard = self.lock.write().await;
        self.facade
            .write_points(&[query.to_point(Utc::now())?])
            .await?;

        tracing::info!(query_name = %query.query_name, "Saved query stored");
        Ok(query)
    }

    /// All saved queries, sorted by name.
    pub async fn list(&self) -> Result<Vec<SavedQuery>, StorageError> {
        let _guard = self.lock.read().await;
        self.load().await
    }

    /// Look up one saved query.
    pub async fn get(&self, name: &str) -> Result<Option<SavedQuery>, StorageError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|q| q.query_name == name))
    }

    /// Execute a saved query once.
    ///
    /// # Errors
    /// `NotFound` if no query has this name.
    pub async fn run(
        &self,
        name: &str,
        time_range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<Vec<QueryRow>, StorageError> {
        let saved = self
            .get(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("saved query '{name}'")))?;
        let spec = QuerySpec::new(saved.measurements, time_range, aggregation);
        self.facade.query(&spec).await
    }

    /// Delete a saved query by wiping the namespace and rewriting the rest.
    ///
    /// # Errors
    /// - `NotFound` if no query has this name (nothing is touched)
    /// - `Timeout` if the wipe timed out and a re-read shows it never applied
    /// - `PartialWrite` if survivors were wiped and could not be rewritten
    pub async fn delete(&self, name: &str) -> Result<SavedQuery, StorageError> {
        let _guard = self.lock.write().await;

        let (removed, remaining): (Vec<_>, Vec<_>) = self
            .load()
            .await?
            .into_iter()
            .partition(|q| q.query_name == name);
        let Some(removed) = removed.into_iter().next() else {
            return Err(StorageError::NotFound(format!("saved query '{name}'")));
        };

        // Encode before wiping so an encoding failure cannot lose data
        let now = Utc::now();
        let points = remaining
            .iter()
            .map(|q| q.to_point(now))
            .collect::<Result<Vec<_>, _>>()?;

        let upper = DateTime::from_timestamp(WIPE_UPPER_BOUND_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self
            .facade
            .delete_range(SAVED_QUERY_MEASUREMENT, DateTime::<Utc>::UNIX_EPOCH, upper)
            .await
        {
            Ok(_) => {}
            Err(e @ StorageError::Timeout { .. }) => {
                return self.recover_timed_out_wipe(removed, remaining, points, e).await;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.facade.write_points(&points).await {
            let at_risk: Vec<String> = remaining.into_iter().map(|q| q.query_name).collect();
            return Err(partial_write(at_risk, &e));
        }

        tracing::info!(query_name = %name, remaining = points.len(), "Saved query deleted");
        Ok(removed)
    }

    /// A timed-out wipe may or may not have applied. Re-read the namespace
    /// and restore whichever survivors are gone.
    async fn recover_timed_out_wipe(
        &self,
        removed: SavedQuery,
        remaining: Vec<SavedQuery>,
        points: Vec<Point>,
        timeout: StorageError,
    ) -> Result<SavedQuery, StorageError> {
        tracing::warn!(query_name = %removed.query_name, error = %timeout, "Saved query wipe timed out, re-reading");

        let present = match self.load().await {
            Ok(present) => present,
            Err(e) => {
                let at_risk: Vec<String> = remaining.into_iter().map(|q| q.query_name).collect();
                return Err(partial_write(at_risk, &e));
            }
        };
        let present: BTreeSet<String> = present.into_iter().map(|q| q.query_name).collect();

        let (missing, missing_points): (Vec<String>, Vec<Point>) = remaining
            .into_iter()
            .zip(points)
            .filter(|(q, _)| !present.contains(&q.query_name))
            .map(|(q, point)| (q.query_name, point))
            .unzip();

        if !missing_points.is_empty()
            && let Err(e) = self.facade.write_points(&missing_points).await
        {
            return Err(partial_write(missing, &e));
        }

        if present.contains(&removed.query_name) {
            // Survivors are intact and the target is still there.
            return Err(timeout);
        }

        tracing::info!(
            query_name = %removed.query_name,
            restored = missing.len(),
            "Saved query deleted after wipe timeout"
        );
        Ok(removed)
    }

    /// Read the namespace. Later rows for a name replace earlier ones.
    async fn load(&self) -> Result<Vec<SavedQuery>, StorageError> {
        let points = self
            .facade
            .scan(SAVED_QUERY_MEASUREMENT, DateTime::<Utc>::UNIX_EPOCH)
            .await?;

        let mut latest = BTreeMap::new();
        for point in &points {
            match SavedQuery::from_point(point) {
                Ok(query) => {
                    latest.insert(query.query_name.clone(), query);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable saved query row"),
            }
        }
        Ok(latest.into_values().collect())
    }
}
