//! Timestamp parsing and human-friendly formatting for message output.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Parse a message `created_at` value.
///
/// The store emits naive ISO timestamps (`2026-01-28T15:04:05.123456`)
/// which are taken as UTC; RFC 3339 values are accepted as well.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let raw = input.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn format_relative(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - timestamp).num_seconds();
    let (delta, future) = if delta < 0 { (-delta, true) } else { (delta, false) };
    if delta < 10 {
        return "now".to_string();
    }
    if delta < 60 {
        return format_relative_unit(delta, "s", future);
    }
    let minutes = delta / 60;
    if minutes < 60 {
        return format_relative_unit(minutes, "m", future);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format_relative_unit(hours, "h", future);
    }
    let days = hours / 24;
    if days < 7 {
        return format_relative_unit(days, "d", future);
    }
    let weeks = days / 7;
    if weeks < 4 {
        return format_relative_unit(weeks, "w", future);
    }
    let months = days / 30;
    if months < 12 {
        return format_relative_unit(months, "mo", future);
    }
    format_relative_unit(days / 365, "y", future)
}

/// Relative date for a raw `created_at`, or `-` if it cannot be parsed.
pub fn relative_from_raw(created_at: &str, now: DateTime<Utc>) -> String {
    parse_timestamp(created_at)
        .map(|timestamp| format_relative(timestamp, now))
        .unwrap_or_else(|| "-".to_string())
}

/// Voice note length as `m:ss`.
pub fn format_duration(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn format_relative_unit(value: i64, unit: &str, future: bool) -> String {
    if future {
        format!("in {value}{unit}")
    } else {
        format!("{value}{unit} ago")
    }
}
