//! SQLite schema definitions.

use sqlx::sqlite::SqlitePool;

use crate::storage::StorageError;

/// One row per (point, field). Timestamps are unix microseconds.
///
/// `kind` is one of `float`, `int`, `bool` or `text`. Integers fill both
/// `value_int` and `value_num` so they aggregate; booleans only `value_int`.
const CREATE_POINTS: &str = r#"
CREATE TABLE IF NOT EXISTS points (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement TEXT    NOT NULL,
    ts          INTEGER NOT NULL,
    tags        TEXT    NOT NULL DEFAULT '{}',
    field       TEXT    NOT NULL,
    kind        TEXT    NOT NULL DEFAULT 'float',
    value_num   REAL,
    value_int   INTEGER,
    value_text  TEXT
)"#;

const CREATE_POINTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_points_measurement_ts ON points (measurement, ts)";

/// Create tables and indexes if they do not exist.
pub(crate) async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for statement in [CREATE_POINTS, CREATE_POINTS_INDEX] {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
