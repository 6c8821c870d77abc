//! Text encodings for dates, wall times and timestamps.
//!
//! Everything written by this crate uses one fixed-width UTC layout so that
//! timestamp columns sort lexicographically. Reading back is lenient because
//! rows written by older builds and documents coming from the remote store use
//! a mix of ISO-8601 variants.

use time::{
    format_description::BorrowedFormatItem, macros::format_description, Date, OffsetDateTime, PrimitiveDateTime, Time,
    UtcOffset,
};

const STORED_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
const DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const WALL_TIME: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const WALL_TIME_FRACTIONAL: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second].[subsecond]");

const OFFSET_FRACTIONAL: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory]:[offset_minute]"
);
const OFFSET_WHOLE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]");
const ZULU_FRACTIONAL: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]Z");
const ZULU_WHOLE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
const BARE_FRACTIONAL: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
const BARE_WHOLE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const SPACED: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Current instant, truncated to the microsecond precision we persist.
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(STORED_TIMESTAMP)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Parse a timestamp written by us, by an older build, or by the remote store.
///
/// Formats are tried in order and the first one that consumes the whole input
/// wins. Inputs without an offset are taken as UTC; a bare date is midnight UTC.
/// Anything else yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in [OFFSET_FRACTIONAL, OFFSET_WHOLE] {
        if let Ok(ts) = OffsetDateTime::parse(s, fmt) {
            return Some(ts);
        }
    }

    for fmt in [ZULU_FRACTIONAL, ZULU_WHOLE, BARE_FRACTIONAL, BARE_WHOLE, SPACED] {
        if let Ok(ts) = PrimitiveDateTime::parse(s, fmt) {
            return Some(ts.assume_utc());
        }
    }

    Date::parse(s, DATE).ok().map(|d| d.midnight().assume_utc())
}

pub fn format_date(date: Date) -> String {
    date.format(DATE).unwrap_or_else(|_| date.to_string())
}

/// Parse a calendar date, ignoring anything after the first ten characters
/// (remote documents sometimes carry a full timestamp in date fields).
pub fn parse_date(raw: &str) -> Option<Date> {
    let s = raw.trim();
    let head = s.get(..10).unwrap_or(s);
    Date::parse(head, DATE).ok()
}

pub fn format_time(t: Time) -> String {
    t.format(WALL_TIME).unwrap_or_else(|_| t.to_string())
}

pub fn parse_time(raw: &str) -> Option<Time> {
    let s = raw.trim();
    Time::parse(s, WALL_TIME)
        .or_else(|_| Time::parse(s, WALL_TIME_FRACTIONAL))
        .ok()
}
