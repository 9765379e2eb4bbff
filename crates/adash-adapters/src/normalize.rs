//! Field-level value coercion applied to every mapped field.

use adash_core::{CellValue, RawRecord, WarehouseRow};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Tracking URLs carry this token; everything after it is noise.
pub const IGNORE_MARKER: &str = "{ignore}";

/// Placeholder the ads report uses for "no value" (sent as `" --"`).
pub const SENTINEL: &str = "--";

/// Zone-less timestamp layouts accepted after the date; a trailing `Z` is stripped first.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Coerces one value. `None` means the field could not be normalized and is
/// left out of the row.
pub fn normalize_value(value: CellValue) -> Option<CellValue> {
    let CellValue::Text(text) = value else {
        return Some(value);
    };

    if let Some(number) = text.trim_end().strip_suffix('%') {
        if is_sentinel(number) {
            return Some(CellValue::Int(0));
        }
        return percent_to_fraction(&text).map(CellValue::Float);
    }
    if is_sentinel(&text) {
        return Some(CellValue::Int(0));
    }
    if let Some(date) = truncate_timestamp(&text) {
        return Some(CellValue::Text(date.to_string()));
    }
    if let Some(url) = strip_ignored_params(&text) {
        return Some(CellValue::Text(url));
    }
    Some(CellValue::Text(text))
}

/// `"12.5%"` -> `0.125`.
pub fn percent_to_fraction(text: &str) -> Option<f64> {
    let number = text.trim().strip_suffix('%')?.trim().replace(',', "");
    number.parse::<f64>().ok().map(|v| v / 100.0)
}

pub fn is_sentinel(text: &str) -> bool {
    text.trim() == SENTINEL
}

/// A bare `YYYY-MM-DDZ` or a full timestamp -> the `YYYY-MM-DD` prefix.
/// Anything else starting with a date (`"2020-05-01 Spring Sale"`) is not touched.
pub fn truncate_timestamp(text: &str) -> Option<&str> {
    let text = text.trim();
    let date = text.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let suffix = &text[10..];
    if suffix.eq_ignore_ascii_case("z") || is_timestamp(text) {
        Some(date)
    } else {
        None
    }
}

fn is_timestamp(text: &str) -> bool {
    if DateTime::parse_from_rfc3339(text).is_ok() {
        return true;
    }
    let local = text
        .strip_suffix(|c: char| c == 'Z' || c == 'z')
        .unwrap_or(text);
    TIMESTAMP_FORMATS
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(local, format).is_ok())
}

/// For URL-like strings: cut at the ignore marker, then drop a dangling `?`.
/// Returns `None` for anything that is not a URL.
pub fn strip_ignored_params(text: &str) -> Option<String> {
    let lower = text.trim_start().to_ascii_lowercase();
    let url_like = lower.starts_with("http://")
        || lower.starts_with("https://")
        || text.contains(IGNORE_MARKER);
    if !url_like {
        return None;
    }
    let mut url = match text.find(IGNORE_MARKER) {
        Some(idx) => &text[..idx],
        None => text,
    };
    if let Some(stripped) = url.strip_suffix('?') {
        url = stripped;
    }
    Some(url.to_string())
}

/// Normalizes every field of a mapped record, omitting fields that fail.
pub fn normalize_record(record: RawRecord) -> WarehouseRow {
    record
        .into_iter()
        .filter_map(|(column, value)| normalize_value(value).map(|v| (column, v)))
        .collect()
}
