use time::OffsetDateTime;

use super::{append_change, LocalStore};
use crate::{
    domain::{timestamps, ChangeOperation, ChangeTable, Meter, MeterChanges},
    error::{StoreError, StoreResult},
};

const METER_COLUMNS: &str = "id, user_id, home_name, meter_name, meter_type, created_at, updated_at, is_active";

#[derive(Debug, sqlx::FromRow)]
struct MeterRow {
    id: String,
    user_id: String,
    home_name: String,
    meter_name: String,
    meter_type: String,
    created_at: String,
    updated_at: Option<String>,
    is_active: i64,
}

impl TryFrom<MeterRow> for Meter {
    type Error = StoreError;

    fn try_from(row: MeterRow) -> Result<Self, Self::Error> {
        let kind = row
            .meter_type
            .parse()
            .map_err(|e: crate::domain::UnknownMeterKind| StoreError::invalid_row("meters", "meter_type", e.to_string()))?;
        let created_at = timestamps::parse_timestamp(&row.created_at)
            .ok_or_else(|| StoreError::invalid_row("meters", "created_at", row.created_at.clone()))?;
        // A malformed update stamp only weakens freshness comparison; keep the row.
        let updated_at = row.updated_at.as_deref().and_then(timestamps::parse_timestamp);

        Ok(Meter {
            id: row.id,
            owner_id: row.user_id,
            home_name: row.home_name,
            meter_name: row.meter_name,
            kind,
            created_at,
            updated_at,
            is_active: row.is_active != 0,
        })
    }
}

impl LocalStore {
    /// Insert a meter and log it for upload.
    ///
    /// A meter whose id is already present is left untouched and its id is
    /// returned, which makes repeated downloads of the same meter harmless.
    /// The (owner, home, meter) uniqueness rule is not checked here; see
    /// [`LocalStore::remove_duplicate_meters`].
    pub async fn add_meter(&self, meter: &Meter) -> StoreResult<String> {
        let (_writer, mut tx) = self.begin_write().await?;

        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM meters WHERE id = ?")
            .bind(&meter.id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            tracing::debug!(meter_id = %meter.id, "meter already present, skipping insert");
            return Ok(meter.id.clone());
        }

        sqlx::query(
            r#"
            INSERT INTO meters (id, user_id, home_name, meter_name, meter_type, created_at, updated_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&meter.id)
        .bind(&meter.owner_id)
        .bind(&meter.home_name)
        .bind(&meter.meter_name)
        .bind(meter.kind.as_str())
        .bind(timestamps::format_timestamp(meter.created_at))
        .bind(meter.updated_at.map(timestamps::format_timestamp))
        .bind(meter.is_active as i64)
        .execute(&mut *tx)
        .await?;

        append_change(&mut tx, ChangeOperation::Insert, ChangeTable::Meters, &meter.id).await?;
        tx.commit().await?;

        Ok(meter.id.clone())
    }

    /// Active meters of `owner_id`, newest first.
    pub async fn get_meters(&self, owner_id: &str) -> StoreResult<Vec<Meter>> {
        let rows = sqlx::query_as::<_, MeterRow>(&format!(
            "SELECT {METER_COLUMNS} FROM meters WHERE user_id = ? AND is_active = 1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Meter::try_from).collect()
    }

    pub async fn get_meter(&self, id: &str) -> StoreResult<Option<Meter>> {
        let row = sqlx::query_as::<_, MeterRow>(&format!("SELECT {METER_COLUMNS} FROM meters WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Meter::try_from).transpose()
    }

    /// Overwrite the mutable attributes of a meter. `updated_at` is taken from
    /// the caller so that a download can adopt the remote stamp.
    pub async fn update_meter(
        &self,
        id: &str,
        changes: &MeterChanges,
        updated_at: OffsetDateTime,
    ) -> StoreResult<bool> {
        let (_writer, mut tx) = self.begin_write().await?;

        let res = sqlx::query(
            r#"
            UPDATE meters
            SET home_name = ?, meter_name = ?, meter_type = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&changes.home_name)
        .bind(&changes.meter_name)
        .bind(changes.kind.as_str())
        .bind(changes.is_active as i64)
        .bind(timestamps::format_timestamp(updated_at))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(false);
        }

        append_change(&mut tx, ChangeOperation::Update, ChangeTable::Meters, id).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Collapse active meters sharing (owner, home, meter label) down to the
    /// earliest-created one. The losers are deleted together with their
    /// readings and every change-log entry that points at either.
    pub async fn remove_duplicate_meters(&self, owner_id: &str) -> StoreResult<usize> {
        let (_writer, mut tx) = self.begin_write().await?;

        let groups: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT home_name, meter_name
            FROM meters
            WHERE user_id = ? AND is_active = 1
            GROUP BY home_name, meter_name
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(owner_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0usize;
        for (home_name, meter_name) in groups {
            let mut candidates: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT id, created_at FROM meters
                WHERE user_id = ? AND home_name = ? AND meter_name = ? AND is_active = 1
                "#,
            )
            .bind(owner_id)
            .bind(&home_name)
            .bind(&meter_name)
            .fetch_all(&mut *tx)
            .await?;

            // Rows written by older builds may carry offsets, so text order is
            // not time order. Unparseable stamps sort last.
            candidates.sort_by_cached_key(|(id, created_at)| {
                let created = timestamps::parse_timestamp(created_at);
                (created.is_none(), created, id.clone())
            });
            let ids: Vec<String> = candidates.into_iter().map(|(id, _)| id).collect();

            for meter_id in ids.iter().skip(1) {
                sqlx::query(
                    "DELETE FROM sync_log WHERE record_id = ? OR record_id IN (SELECT id FROM readings WHERE meter_id = ?)",
                )
                .bind(meter_id)
                .bind(meter_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM readings WHERE meter_id = ?")
                    .bind(meter_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM meters WHERE id = ?")
                    .bind(meter_id)
                    .execute(&mut *tx)
                    .await?;

                removed += 1;
                tracing::info!(
                    meter_id = %meter_id,
                    kept = %ids[0],
                    home_name = %home_name,
                    meter_name = %meter_name,
                    "removed duplicate meter"
                );
            }
        }

        tx.commit().await?;
        Ok(removed)
    }
}
