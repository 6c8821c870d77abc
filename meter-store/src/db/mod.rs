//! SQLite-backed local store: meters, readings and the outbound change log.
//!
//! Every public operation runs inside a single transaction, so the primary
//! mutation and its change-log entry land together or not at all. Writing
//! transactions are serialized through one store-wide lock: deferred SQLite
//! transactions that read before they write cannot be upgraded concurrently
//! on a WAL database.

mod change_log_queries;
mod meter_queries;
mod reading_queries;

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Sqlite, SqliteConnection, Transaction,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    domain::{timestamps, ChangeOperation, ChangeTable},
    error::StoreResult,
};

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS meters (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        home_name TEXT NOT NULL,
        meter_name TEXT NOT NULL,
        meter_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        meter_id TEXT NOT NULL,
        reading_value REAL NOT NULL,
        previous_reading REAL NOT NULL DEFAULT 0,
        consumption_kwh REAL NOT NULL,
        reading_date TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation TEXT NOT NULL,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

// Columns added after the first release. Databases created by older builds
// lack them; fresh databases get them through the same path.
const ADDITIVE_COLUMNS: &[&str] = &[
    "ALTER TABLE readings ADD COLUMN reading_time TEXT NOT NULL DEFAULT '12:00:00'",
    "ALTER TABLE meters ADD COLUMN updated_at TEXT",
];

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_readings_meter_date ON readings (meter_id, reading_date, reading_time)",
    "CREATE INDEX IF NOT EXISTS idx_sync_log_pending ON sync_log (synced, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_sync_log_record ON sync_log (record_id)",
];

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Open (creating if needed) the database file at `path` and bring its
    /// schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
        tracing::info!(path = %path.as_ref().display(), "opened local store");

        Self::from_pool(pool).await
    }

    /// Private in-memory database, mostly for tests. A single connection is
    /// kept alive for the lifetime of the pool.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a writing transaction. The returned guard must outlive the
    /// transaction.
    async fn begin_write(&self) -> Result<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>), sqlx::Error> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await?;
        Ok((guard, tx))
    }

    /// Idempotent schema setup. Additive columns are attempted and a
    /// "duplicate column" failure is ignored.
    pub async fn migrate(&self) -> StoreResult<()> {
        for ddl in CREATE_TABLES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        for ddl in ADDITIVE_COLUMNS {
            match sqlx::query(ddl).execute(&self.pool).await {
                Ok(_) => tracing::debug!(ddl, "applied additive column"),
                Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column") => {}
                Err(e) => return Err(e.into()),
            }
        }

        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }
}

async fn append_change(
    conn: &mut SqliteConnection,
    operation: ChangeOperation,
    table: ChangeTable,
    record_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO sync_log (operation, table_name, record_id, timestamp) VALUES (?, ?, ?, ?)")
        .bind(operation.as_str())
        .bind(table.as_str())
        .bind(record_id)
        .bind(timestamps::format_timestamp(timestamps::now_utc()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
