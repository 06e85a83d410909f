//! Row normalization: raw header-keyed text → typed canonical records.
//!
//! Coercion never fails loudly. A value that cannot be coerced becomes
//! null; a null in a required field rejects the row. Rejections never
//! abort the batch.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};

use crate::error::IngestError;
use crate::mapping::{ColumnMapping, HeaderBinding};
use crate::models::{
    FieldType, FieldValue, NormalizedRow, ParsedTable, RejectionKind, RowRejection,
};

/// Day zero of the 1900 spreadsheet date system. Starting on Dec 30
/// absorbs the phantom 1900-02-29, so serials from 61 on are exact.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
/// Serial number of 9999-12-31.
const MAX_SERIAL: f64 = 2_958_465.0;

/// Day-first formats tried after ISO and serial numbers.
const DAY_FIRST_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%y", "%d-%m-%y", "%d.%m.%y",
];

/// Accepted and rejected rows of one table.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub accepted: Vec<NormalizedRow>,
    pub rejected: Vec<RowRejection>,
    pub unmapped_headers: Vec<String>,
}

fn strip_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Thousands separators only: "1,234.5" and "12,000", never "1,5".
    let grouped = match (trimmed.rfind(','), trimmed.find('.')) {
        (Some(comma), Some(dot)) => comma < dot,
        (Some(_), None) => trimmed.split(',').skip(1).all(|group| group.len() == 3),
        _ => false,
    };
    if grouped {
        Some(trimmed.replace(',', ""))
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a finite decimal; anything else is `None`, never zero.
pub fn coerce_decimal(raw: &str) -> Option<f64> {
    strip_number(raw)?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Parse an integer, accepting integral decimals such as `12.0`.
pub fn coerce_integer(raw: &str) -> Option<i64> {
    let cleaned = strip_number(raw)?;
    if let Ok(v) = cleaned.parse::<i64>() {
        return Some(v);
    }
    let v = cleaned.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

pub fn coerce_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn iso_date(s: &str) -> Option<NaiveDate> {
    // Date part of "2024-01-05", "2024-01-05T08:30:00" or "2024-01-05 08:30".
    let head = s.split(['T', ' ']).next().unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y/%m/%d"))
        .ok()
        .filter(|d| d.year() >= 1000)
}

/// Convert a spreadsheet serial day count to a date. The fractional part
/// (time of day) is ignored.
pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_SERIAL {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}

fn serial_date(s: &str) -> Option<NaiveDate> {
    if !s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    serial_to_date(s.parse::<f64>().ok()?)
}

fn day_first_date(s: &str) -> Option<NaiveDate> {
    DAY_FIRST_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(s, fmt)
            .ok()
            // %y accepts four-digit years too; keep two-digit years in a sane range.
            .filter(|d| d.year() >= 1900)
    })
}

/// Parse a date from ISO text, a spreadsheet serial number, or day-first
/// text, in that order. The first that yields a calendar date wins.
///
/// ```
/// use chrono::NaiveDate;
/// use field_trial_ingest::normalize::coerce_date;
///
/// assert_eq!(coerce_date("2024-01-05"), NaiveDate::from_ymd_opt(2024, 1, 5));
/// assert_eq!(coerce_date("45000"), NaiveDate::from_ymd_opt(2023, 3, 15));
/// assert_eq!(coerce_date("05/01/2024"), NaiveDate::from_ymd_opt(2024, 1, 5));
/// assert_eq!(coerce_date("soon"), None);
/// ```
pub fn coerce_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    iso_date(s)
        .or_else(|| serial_date(s))
        .or_else(|| day_first_date(s))
}

/// Coerce one raw value according to its declared type.
pub fn coerce(raw: &str, field_type: FieldType) -> Option<FieldValue> {
    match field_type {
        FieldType::Text => coerce_text(raw).map(FieldValue::Text),
        FieldType::Integer => coerce_integer(raw).map(FieldValue::Integer),
        FieldType::Decimal => coerce_decimal(raw).map(FieldValue::Decimal),
        FieldType::Date => coerce_date(raw).map(FieldValue::Date),
    }
}

/// Fail when a required field has no column at all; every row would be
/// rejected and the user needs to fix the header, not the rows.
pub fn check_required_columns(
    mapping: &ColumnMapping,
    binding: &HeaderBinding,
    defaults: &BTreeMap<String, FieldValue>,
) -> Result<(), IngestError> {
    for field in mapping.required_fields {
        if !binding.is_bound(field) && !defaults.contains_key(*field) {
            return Err(IngestError::MissingColumn {
                field: field.to_string(),
                accepted: mapping.accepted_spellings(field),
            });
        }
    }
    Ok(())
}

/// Normalize every row of `table` against `mapping`.
///
/// `defaults` fill fields that are still null after coercion.
pub fn normalize_table(
    table: &ParsedTable,
    mapping: &ColumnMapping,
    binding: &HeaderBinding,
    defaults: &BTreeMap<String, FieldValue>,
) -> Normalized {
    let mut out = Normalized {
        unmapped_headers: binding.unmapped.clone(),
        ..Normalized::default()
    };

    for row in &table.rows {
        let mut fields = BTreeMap::new();
        for spec in mapping.fields {
            let value = binding
                .header_for(spec.name)
                .and_then(|header| row.get(header))
                .and_then(|raw| coerce(raw, spec.field_type));
            if let Some(value) = value {
                fields.insert(spec.name.to_string(), value);
            }
        }
        for (name, value) in defaults {
            fields
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        let missing = mapping
            .required_fields
            .iter()
            .find(|f| !fields.contains_key(**f));
        match missing {
            Some(field) => out.rejected.push(RowRejection {
                row_index: row.index,
                kind: RejectionKind::Invalid,
                reason: format!("row {}: missing {}", row.index, field),
            }),
            None => out.accepted.push(NormalizedRow {
                index: row.index,
                fields,
            }),
        }
    }
    out
}
