//! Date argument parsing.
//!
//! Commands and instance parameters take dates as absolute timestamps or as
//! relative expressions like `3 days` or `1 hour ago`.

use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Output layout used for `_time` fields and most vendor query parameters.
pub const ISO_Z_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parses an absolute or relative date expression relative to now.
pub fn parse_date_arg(value: &str) -> ConnectorResult<DateTime<Utc>> {
    parse_date_arg_at(value, Utc::now())
}

/// Parses a date expression, resolving relative forms against `now`.
pub fn parse_date_arg_at(value: &str, now: DateTime<Utc>) -> ConnectorResult<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConnectorError::invalid_argument("Empty date value"));
    }

    if let Ok(epoch) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| invalid_date(value));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    parse_relative(value)
        .map(|offset| now - offset)
        .ok_or_else(|| invalid_date(value))
}

/// Parses `N unit[s] [ago]` into the offset it describes.
pub fn parse_relative(value: &str) -> Option<Duration> {
    let lowered = value.trim().to_ascii_lowercase();
    let mut parts = lowered.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    match parts.next() {
        None | Some("ago") => {}
        Some(_) => return None,
    }
    if parts.next().is_some() || amount < 0 {
        return None;
    }

    let unit = unit.strip_suffix('s').unwrap_or(unit);
    let duration = match unit {
        "second" | "sec" => Duration::seconds(amount),
        "minute" | "min" => Duration::minutes(amount),
        "hour" => Duration::hours(amount),
        "day" => Duration::days(amount),
        "week" => Duration::weeks(amount),
        "month" => Duration::days(amount * 30),
        "year" => Duration::days(amount * 365),
        _ => return None,
    };
    Some(duration)
}

/// Renders `%Y-%m-%dT%H:%M:%SZ`.
pub fn format_iso_z(dt: &DateTime<Utc>) -> String {
    dt.format(ISO_Z_FORMAT).to_string()
}

fn invalid_date(value: &str) -> ConnectorError {
    ConnectorError::invalid_argument(format!("Invalid date: \"{}\"", value))
}
