// ── Persistence ──
//
// One SQLite file holds the bridge's entire durable footprint: controller
// identity, pairings and pairing checkpoints, the device and zone
// registry, bucketed history and the metadata caches. Current state is
// not stored separately; it is rebuilt from the newest history bucket.

mod cache;
mod history;
mod pairing;
mod registry;

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

use crate::error::CoreError;
use crate::model::{TrackedField, ValueKind};

pub use cache::{AccessoryCacheEntry, CloudCacheEntry};
pub use pairing::{PairingCheckpoint, StoredPairing};
pub use registry::CloudDeviceAttrs;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS controller_identity (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    controller_id TEXT NOT NULL,
    secret_key    BLOB NOT NULL,
    public_key    BLOB NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairings (
    gateway_address TEXT PRIMARY KEY,
    credential      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairing_sessions (
    gateway_address TEXT PRIMARY KEY,
    controller_id   TEXT NOT NULL,
    phase           INTEGER NOT NULL,
    salt            TEXT NOT NULL,
    public_key      TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS zones (
    zone_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    cloud_id         INTEGER UNIQUE,
    name             TEXT NOT NULL,
    zone_type        TEXT,
    leader_device_id INTEGER,
    sort_order       INTEGER NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    device_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    serial_number     TEXT NOT NULL UNIQUE,
    aid               INTEGER,
    zone_id           INTEGER REFERENCES zones(zone_id) ON DELETE SET NULL,
    kind              TEXT NOT NULL,
    name              TEXT,
    model             TEXT,
    manufacturer      TEXT,
    battery_state     TEXT,
    firmware_version  TEXT,
    is_circuit_driver INTEGER NOT NULL DEFAULT 0,
    first_seen        TEXT NOT NULL,
    last_seen         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accessory_cache (
    identity_key   TEXT PRIMARY KEY,
    config_version INTEGER,
    state_number   INTEGER,
    broadcast_key  TEXT,
    accessories    TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cloud_cache (
    endpoint   TEXT PRIMARY KEY,
    body       TEXT NOT NULL,
    etag       TEXT,
    expires_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cloud_tokens (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    refresh_token TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
";

/// History table, one nullable column per tracked field.
fn history_schema() -> String {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS device_state_history (\n    \
         device_id INTEGER NOT NULL REFERENCES devices(device_id) ON DELETE CASCADE,\n    \
         bucket INTEGER NOT NULL,\n",
    );
    for field in TrackedField::ALL {
        let ty = match field.kind() {
            ValueKind::Float => "REAL",
            ValueKind::Int => "INTEGER",
        };
        let _ = writeln!(sql, "    {} {ty},", field.column());
    }
    sql.push_str(
        "    updated_at TEXT NOT NULL,\n    PRIMARY KEY (device_id, bucket)\n);\n\
         CREATE INDEX IF NOT EXISTS idx_history_bucket ON device_state_history(bucket);\n",
    );
    sql
}

/// Handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Storage {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes every write.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!(path = %path.display(), "state database ready");
        Ok(db)
    }

    /// Private in-memory database, for one-off runs and tests.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        let history = history_schema();
        sqlx::raw_sql(&history).execute(&self.pool).await?;
        Ok(())
    }
}

/// SQLite stores integers as i64.
pub(crate) fn to_db_int(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}

pub(crate) fn from_db_int(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn history_schema_has_a_column_per_field() {
        let sql = history_schema();
        for field in TrackedField::ALL {
            assert!(sql.contains(field.column()), "{field}");
        }
        assert!(sql.contains("current_temperature REAL"));
        assert!(sql.contains("status_low_battery INTEGER"));
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.db");
        let db = Database::open(&path).await.unwrap();
        assert!(path.exists());

        // Reopening applies the schema idempotently.
        db.close().await;
        Database::open(&path).await.unwrap();
    }
}
