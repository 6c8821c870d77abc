use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use time::{Date, Time};

use super::{append_change, LocalStore};
use crate::{
    domain::{
        derive_consumption, timestamps, ChangeOperation, ChangeTable, DailyConsumption, NewReading, Reading,
        DEFAULT_READING_TIME,
    },
    error::{StoreError, StoreResult},
};

const READING_COLUMNS: &str = "id, user_id, meter_id, reading_value, previous_reading, consumption_kwh, \
                               reading_date, reading_time, created_at, updated_at";

// Derived fields are rewritten only when they drift by more than this.
const DERIVED_EPSILON: f64 = 1e-9;

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: String,
    user_id: String,
    meter_id: String,
    reading_value: f64,
    previous_reading: f64,
    consumption_kwh: f64,
    reading_date: String,
    reading_time: String,
    created_at: String,
    updated_at: Option<String>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        let reading_date = timestamps::parse_date(&row.reading_date)
            .ok_or_else(|| StoreError::invalid_row("readings", "reading_date", row.reading_date.clone()))?;
        let reading_time = timestamps::parse_time(&row.reading_time).unwrap_or(DEFAULT_READING_TIME);
        let created_at = timestamps::parse_timestamp(&row.created_at)
            .ok_or_else(|| StoreError::invalid_row("readings", "created_at", row.created_at.clone()))?;
        let updated_at = row.updated_at.as_deref().and_then(timestamps::parse_timestamp);

        Ok(Reading {
            id: row.id,
            owner_id: row.user_id,
            meter_id: row.meter_id,
            value: row.reading_value,
            previous_value: row.previous_reading,
            consumption: row.consumption_kwh,
            reading_date,
            reading_time,
            created_at,
            updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DailyRow {
    reading_date: String,
    first_time: String,
    last_time: String,
    min_value: f64,
    max_value: f64,
    reading_count: i64,
}

fn validate_value(value: f64) -> StoreResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(StoreError::InvalidReadingValue(value))
    }
}

fn push_period_filter(builder: &mut QueryBuilder<'_, Sqlite>, year: Option<i32>, month: Option<u8>) {
    if let Some(year) = year {
        builder.push(" AND strftime('%Y', reading_date) = ");
        builder.push_bind(format!("{year:04}"));
    }
    if let Some(month) = month {
        builder.push(" AND strftime('%m', reading_date) = ");
        builder.push_bind(format!("{month:02}"));
    }
}

/// Value of the latest reading on `meter_id` dated strictly before `date`,
/// optionally ignoring one reading (the one being edited).
async fn preceding_value(
    conn: &mut SqliteConnection,
    meter_id: &str,
    date: Date,
    exclude_id: Option<&str>,
) -> Result<Option<f64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT reading_value FROM readings
        WHERE meter_id = ? AND reading_date < ? AND id != ?
        ORDER BY reading_date DESC, reading_time DESC
        LIMIT 1
        "#,
    )
    .bind(meter_id)
    .bind(timestamps::format_date(date))
    .bind(exclude_id.unwrap_or(""))
    .fetch_optional(&mut *conn)
    .await
}

/// Re-derive previous/consumption for every reading of a meter after an
/// insert, edit or delete changed the chain. Only drifted rows are written and
/// no change-log entry is produced: derived fields are never uploaded.
async fn rederive_chain(conn: &mut SqliteConnection, meter_id: &str) -> Result<u64, sqlx::Error> {
    let rows: Vec<(String, f64, f64, f64, String)> = sqlx::query_as(
        r#"
        SELECT id, reading_value, previous_reading, consumption_kwh, reading_date
        FROM readings
        WHERE meter_id = ?
        ORDER BY reading_date ASC, reading_time ASC, id ASC
        "#,
    )
    .bind(meter_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut baseline: Option<f64> = None;
    let mut current_day: Option<String> = None;
    let mut last_of_day: Option<f64> = None;
    let mut rewritten = 0u64;

    for (id, value, previous, consumption, day) in rows {
        if current_day.as_deref() != Some(day.as_str()) {
            if last_of_day.is_some() {
                baseline = last_of_day;
            }
            current_day = Some(day);
        }
        last_of_day = Some(value);

        let (expected_previous, expected_consumption) = derive_consumption(baseline, value);
        if (expected_previous - previous).abs() > DERIVED_EPSILON
            || (expected_consumption - consumption).abs() > DERIVED_EPSILON
        {
            sqlx::query("UPDATE readings SET previous_reading = ?, consumption_kwh = ? WHERE id = ?")
                .bind(expected_previous)
                .bind(expected_consumption)
                .bind(&id)
                .execute(&mut *conn)
                .await?;
            rewritten += 1;
        }
    }

    if rewritten > 0 {
        tracing::debug!(meter_id, rewritten, "re-derived consumption chain");
    }

    Ok(rewritten)
}

impl LocalStore {
    /// Insert a reading, deriving previous value and consumption from the most
    /// recent reading on an earlier day. Duplicate ids are a no-op.
    pub async fn add_reading(&self, reading: &NewReading) -> StoreResult<String> {
        validate_value(reading.value)?;

        let (_writer, mut tx) = self.begin_write().await?;

        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM readings WHERE id = ?")
            .bind(&reading.id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            tracing::debug!(reading_id = %reading.id, "reading already present, skipping insert");
            return Ok(reading.id.clone());
        }

        let previous = preceding_value(&mut tx, &reading.meter_id, reading.reading_date, None).await?;
        let (previous_value, consumption) = derive_consumption(previous, reading.value);

        sqlx::query(
            r#"
            INSERT INTO readings (id, user_id, meter_id, reading_value, previous_reading, consumption_kwh,
                                  reading_date, reading_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.id)
        .bind(&reading.owner_id)
        .bind(&reading.meter_id)
        .bind(reading.value)
        .bind(previous_value)
        .bind(consumption)
        .bind(timestamps::format_date(reading.reading_date))
        .bind(timestamps::format_time(reading.reading_time.unwrap_or(DEFAULT_READING_TIME)))
        .bind(timestamps::format_timestamp(reading.created_at))
        .execute(&mut *tx)
        .await?;

        append_change(&mut tx, ChangeOperation::Insert, ChangeTable::Readings, &reading.id).await?;
        rederive_chain(&mut tx, &reading.meter_id).await?;
        tx.commit().await?;

        Ok(reading.id.clone())
    }

    pub async fn get_reading(&self, id: &str) -> StoreResult<Option<Reading>> {
        let row = sqlx::query_as::<_, ReadingRow>(&format!("SELECT {READING_COLUMNS} FROM readings WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Reading::try_from).transpose()
    }

    /// Readings of a meter, newest first by (date, time), optionally limited
    /// to a calendar year and/or month.
    pub async fn get_readings(
        &self,
        meter_id: &str,
        year: Option<i32>,
        month: Option<u8>,
    ) -> StoreResult<Vec<Reading>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {READING_COLUMNS} FROM readings WHERE meter_id = "));
        builder.push_bind(meter_id);
        push_period_filter(&mut builder, year, month);
        builder.push(" ORDER BY reading_date DESC, reading_time DESC, id DESC");

        let rows = builder.build_query_as::<ReadingRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    /// One row per reading day, newest day first. A day with a single reading
    /// has zero consumption; otherwise it is the spread between the lowest and
    /// highest value read that day.
    pub async fn get_daily_consumption(
        &self,
        meter_id: &str,
        year: Option<i32>,
        month: Option<u8>,
    ) -> StoreResult<Vec<DailyConsumption>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT reading_date,
                   MIN(reading_time) AS first_time,
                   MAX(reading_time) AS last_time,
                   MIN(reading_value) AS min_value,
                   MAX(reading_value) AS max_value,
                   COUNT(*) AS reading_count
            FROM readings
            WHERE meter_id = "#,
        );
        builder.push_bind(meter_id);
        push_period_filter(&mut builder, year, month);
        builder.push(" GROUP BY reading_date ORDER BY reading_date DESC");

        let rows = builder.build_query_as::<DailyRow>().fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let date = timestamps::parse_date(&row.reading_date)
                    .ok_or_else(|| StoreError::invalid_row("readings", "reading_date", row.reading_date.clone()))?;
                let consumption = if row.reading_count > 1 {
                    (row.max_value - row.min_value).max(0.0)
                } else {
                    0.0
                };
                Ok(DailyConsumption {
                    date,
                    first_time: timestamps::parse_time(&row.first_time).unwrap_or(DEFAULT_READING_TIME),
                    last_time: timestamps::parse_time(&row.last_time).unwrap_or(DEFAULT_READING_TIME),
                    min_value: row.min_value,
                    max_value: row.max_value,
                    reading_count: row.reading_count,
                    consumption,
                })
            })
            .collect()
    }

    /// Whether any reading exists on `meter_id` for the calendar day `date`.
    pub async fn has_reading_on(&self, meter_id: &str, date: Date) -> StoreResult<bool> {
        let start = timestamps::format_date(date);
        let end = date
            .next_day()
            .map(timestamps::format_date)
            .unwrap_or_else(|| format!("{start}~"));

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM readings WHERE meter_id = ? AND reading_date >= ? AND reading_date < ?",
        )
        .bind(meter_id)
        .bind(&start)
        .bind(&end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Edit value/date (and optionally time) of a reading. Returns `false` when
    /// the reading does not exist.
    pub async fn update_reading(
        &self,
        id: &str,
        value: f64,
        date: Date,
        time: Option<Time>,
    ) -> StoreResult<bool> {
        validate_value(value)?;

        let (_writer, mut tx) = self.begin_write().await?;

        let meter_id: Option<String> = sqlx::query_scalar("SELECT meter_id FROM readings WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(meter_id) = meter_id else {
            return Ok(false);
        };

        let previous = preceding_value(&mut tx, &meter_id, date, Some(id)).await?;
        let (previous_value, consumption) = derive_consumption(previous, value);

        sqlx::query(
            r#"
            UPDATE readings
            SET reading_value = ?, previous_reading = ?, consumption_kwh = ?,
                reading_date = ?, reading_time = COALESCE(?, reading_time), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(value)
        .bind(previous_value)
        .bind(consumption)
        .bind(timestamps::format_date(date))
        .bind(time.map(timestamps::format_time))
        .bind(timestamps::format_timestamp(timestamps::now_utc()))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        append_change(&mut tx, ChangeOperation::Update, ChangeTable::Readings, id).await?;
        rederive_chain(&mut tx, &meter_id).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Hard-delete a reading. The delete is logged only when the row existed.
    pub async fn delete_reading(&self, id: &str) -> StoreResult<bool> {
        let (_writer, mut tx) = self.begin_write().await?;

        let meter_id: Option<String> = sqlx::query_scalar("SELECT meter_id FROM readings WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(meter_id) = meter_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM readings WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        append_change(&mut tx, ChangeOperation::Delete, ChangeTable::Readings, id).await?;
        rederive_chain(&mut tx, &meter_id).await?;
        tx.commit().await?;

        Ok(true)
    }
}
