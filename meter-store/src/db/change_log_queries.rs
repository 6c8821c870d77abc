use sqlx::{QueryBuilder, Sqlite};

use super::LocalStore;
use crate::{
    domain::{timestamps, ChangeLogEntry},
    error::{StoreError, StoreResult},
};

// Keeps IN lists well under SQLite's bound-parameter limit.
const SETTLE_CHUNK: usize = 500;

#[derive(Debug, sqlx::FromRow)]
struct ChangeRow {
    id: i64,
    operation: String,
    table_name: String,
    record_id: String,
    timestamp: String,
    synced: i64,
}

impl TryFrom<ChangeRow> for ChangeLogEntry {
    type Error = StoreError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(ChangeLogEntry {
            seq: row.id,
            operation: row
                .operation
                .parse()
                .map_err(|e: String| StoreError::invalid_row("sync_log", "operation", e))?,
            table: row
                .table_name
                .parse()
                .map_err(|e: String| StoreError::invalid_row("sync_log", "table_name", e))?,
            record_id: row.record_id,
            timestamp: timestamps::parse_timestamp(&row.timestamp)
                .ok_or_else(|| StoreError::invalid_row("sync_log", "timestamp", row.timestamp.clone()))?,
            settled: row.synced != 0,
        })
    }
}

impl LocalStore {
    /// Change-log entries not yet applied remotely, oldest first.
    pub async fn get_unsettled_changes(&self) -> StoreResult<Vec<ChangeLogEntry>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, operation, table_name, record_id, timestamp, synced
            FROM sync_log
            WHERE synced = 0
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeLogEntry::try_from).collect()
    }

    /// Mark every unsettled entry for the given record ids as settled and
    /// return how many entries flipped.
    pub async fn mark_settled(&self, record_ids: &[String]) -> StoreResult<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let (_writer, mut tx) = self.begin_write().await?;
        let mut settled = 0u64;

        for chunk in record_ids.chunks(SETTLE_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE sync_log SET synced = 1 WHERE synced = 0 AND record_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            settled += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(records = record_ids.len(), settled, "settled change-log entries");

        Ok(settled)
    }
}
