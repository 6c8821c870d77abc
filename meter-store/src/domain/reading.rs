use time::{macros::time, Date, OffsetDateTime, Time};

use super::timestamps::format_date;

/// Wall time assigned to readings that were recorded without one.
pub const DEFAULT_READING_TIME: Time = time!(12:00:00);

/// A value read off a meter, with consumption derived against the latest
/// reading from an earlier day.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: String,
    pub owner_id: String,
    pub meter_id: String,
    pub value: f64,
    pub previous_value: f64,
    pub consumption: f64,
    pub reading_date: Date,
    pub reading_time: Time,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

impl Reading {
    /// Comparison key shared with the remote copy: one unit per meter and day.
    pub fn day_key(&self) -> String {
        reading_key(&self.meter_id, self.reading_date)
    }

    pub fn label(&self) -> String {
        format!("{} on {}", self.value, format_date(self.reading_date))
    }
}

/// Input for [`crate::LocalStore::add_reading`]; derived fields are computed by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub id: String,
    pub owner_id: String,
    pub meter_id: String,
    pub value: f64,
    pub reading_date: Date,
    pub reading_time: Option<Time>,
    pub created_at: OffsetDateTime,
}

/// Per-day aggregate returned by [`crate::LocalStore::get_daily_consumption`].
#[derive(Debug, Clone, PartialEq)]
pub struct DailyConsumption {
    pub date: Date,
    pub first_time: Time,
    pub last_time: Time,
    pub min_value: f64,
    pub max_value: f64,
    pub reading_count: i64,
    pub consumption: f64,
}

pub fn reading_key(meter_id: &str, date: Date) -> String {
    format!("{}_{}", meter_id, format_date(date))
}

/// Returns `(previous_value, consumption)` for `value` given the value of the
/// preceding reading, if any.
///
/// The first reading of a meter is its own baseline. A drop (meter replaced or
/// rolled over) counts as zero consumption rather than a negative delta.
pub fn derive_consumption(previous: Option<f64>, value: f64) -> (f64, f64) {
    match previous {
        Some(prev) => (prev, (value - prev).max(0.0)),
        None => (value, 0.0),
    }
}
