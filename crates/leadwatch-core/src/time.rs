//! Timestamp handling for sheet cells and reminder scheduling.
//!
//! Everything is compared in UTC. Sheet cells without zone information are
//! taken to already be UTC.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc,
};
use thiserror::Error;

/// Layout written back to the sheet and used for ledger keys.
pub const EXTERNAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_LAYOUTS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_LAYOUTS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized timestamp: {0:?}")]
pub struct TimeParseError(pub String);

/// Parses a sheet cell. Blank input is `Ok(None)`.
pub fn parse_timestamp(raw: &str) -> Result<Option<DateTime<Utc>>, TimeParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    for layout in DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Ok(Some(Utc.from_utc_datetime(&naive)));
        }
    }

    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, layout) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Some(Utc.from_utc_datetime(&naive)));
            }
        }
    }

    if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(zoned.with_timezone(&Utc)));
    }

    for layout in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Ok(Some(Utc.from_utc_datetime(&naive)));
        }
    }

    Err(TimeParseError(raw.to_string()))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(EXTERNAL_FORMAT).to_string()
}

pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

/// True when `now` falls within `tolerance` of `target - lead`.
pub fn within_window(
    now: DateTime<Utc>,
    target: DateTime<Utc>,
    lead: Duration,
    tolerance: Duration,
) -> bool {
    let center = target - lead;
    now >= center - tolerance && now <= center + tolerance
}

pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    let naive = ts.date_naive().and_hms_opt(0, 0, 0).unwrap_or(ts.naive_utc());
    Utc.from_utc_datetime(&naive)
}

/// Midnight of the Monday starting the week that contains `ts`.
pub fn start_of_week(ts: DateTime<Utc>) -> DateTime<Utc> {
    let days_from_monday = i64::from(ts.weekday().num_days_from_monday());
    start_of_day(ts) - Duration::days(days_from_monday)
}
