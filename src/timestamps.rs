//! Timestamp encoding shared by the store and the table inspectors.
//!
//! Everything this crate writes uses a fixed-width RFC 3339 form
//! (`2026-01-02T03:04:05.000000Z`) so that SQLite text comparison orders
//! timestamps chronologically. Output tables written by ingestion jobs are not
//! under our control, so reading their recency columns is more tolerant.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Value;

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Parses a value read from an arbitrary recency column.
///
/// Accepts RFC 3339 text, SQLite `datetime()` text (`YYYY-MM-DD HH:MM:SS`,
/// optionally with fractional seconds), bare dates, and unix epoch seconds
/// stored as integers or reals.
pub fn parse_loose(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(secs) => Utc.timestamp_opt(*secs, 0).single(),
        Value::Real(secs) => Utc.timestamp_opt(secs.trunc() as i64, 0).single(),
        Value::Text(s) => parse_loose_str(s),
        _ => None,
    }
}

fn parse_loose_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Some(dt) = parse_timestamp(s) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
