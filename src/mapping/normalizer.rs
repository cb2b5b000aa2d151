//! Cell value normalization.
//!
//! Normalization is lenient: a date or month that fails every pattern passes
//! through unchanged so the validation engine can reject the row with a
//! proper data fault instead of the mapper guessing.

use chrono::{NaiveDate, NaiveDateTime};

use crate::config::NormalizeKind;

const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// Normalize one raw cell. Empty and whitespace-only values become `None`.
pub fn normalize(kind: NormalizeKind, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = match kind {
        NormalizeKind::Text => trimmed.to_string(),
        NormalizeKind::Number => normalize_number(trimmed),
        NormalizeKind::Date => parse_date(trimmed)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| trimmed.to_string()),
        NormalizeKind::Month => parse_month(trimmed)
            .map(|(y, m)| format!("{y:04}-{m:02}"))
            .unwrap_or_else(|| trimmed.to_string()),
    };
    Some(value)
}

/// Strip thousands separators and interior whitespace.
fn normalize_number(s: &str) -> String {
    s.chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect()
}

/// Try the ordered date patterns, each with an optional time suffix.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    for pattern in DATE_PATTERNS {
        if let Ok(d) = NaiveDate::parse_from_str(s, pattern) {
            return Some(d);
        }
        let with_time = format!("{pattern} %H:%M:%S");
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, &with_time) {
            return Some(dt.date());
        }
    }
    None
}

/// `yyyy-MM` or `MM/yyyy`, returned as (year, month).
pub fn parse_month(s: &str) -> Option<(i32, u32)> {
    let (year, month) = if let Some((y, m)) = s.split_once('-') {
        (y, m)
    } else if let Some((m, y)) = s.split_once('/') {
        (y, m)
    } else {
        return None;
    };
    let year: i32 = year.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
        return None;
    }
    Some((year, month))
}

/// Number check used by the data-type rule, applied after normalization.
pub fn parse_number(s: &str) -> Option<f64> {
    normalize_number(s.trim()).parse().ok()
}
