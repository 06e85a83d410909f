//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the uploads, parsed rows, typed rows and results
//! that flow from raw bytes to persisted trial data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Category of uploaded trial data.
///
/// The tag string (see [`DataType::as_str`]) is what gets stored in the
/// database and accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    SoilHealth,
    SoilChemistry,
    PlotData,
    SampleMetadata,
    TissueAnalysis,
    TrialSummary,
    Photo,
    Unknown,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::SoilHealth,
        DataType::SoilChemistry,
        DataType::PlotData,
        DataType::SampleMetadata,
        DataType::TissueAnalysis,
        DataType::TrialSummary,
        DataType::Photo,
        DataType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::SoilHealth => "soil_health",
            DataType::SoilChemistry => "soil_chemistry",
            DataType::PlotData => "plot_data",
            DataType::SampleMetadata => "sample_metadata",
            DataType::TissueAnalysis => "tissue_analysis",
            DataType::TrialSummary => "trial_summary",
            DataType::Photo => "photo",
            DataType::Unknown => "unknown",
        }
    }

    /// Whether uploads of this type go through the row-oriented path.
    pub fn is_tabular(&self) -> bool {
        !matches!(
            self,
            DataType::TrialSummary | DataType::Photo | DataType::Unknown
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.as_str() == key)
            .ok_or_else(|| {
                let known: Vec<&str> = DataType::ALL.iter().map(|d| d.as_str()).collect();
                format!("unknown data type '{}'. Known: {}", s, known.join(", "))
            })
    }
}

/// Declared type of a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Date,
}

/// A coerced, typed field value.
///
/// Serializes untagged so persisted JSON keeps numbers as numbers and
/// dates as `YYYY-MM-DD` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    /// Canonical text rendering, used for natural keys.
    pub fn key_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(d) => d.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Raw upload payload.
#[derive(Debug, Clone)]
pub enum UploadContent {
    /// Delimited text (CSV, TSV, semicolon-separated).
    Text(String),
    /// Spreadsheet workbook bytes.
    Binary(Vec<u8>),
}

impl UploadContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            UploadContent::Text(s) => s.as_bytes(),
            UploadContent::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One data row as read from the source, keyed by cleaned header text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 1-based data row number (header row excluded, blank rows counted).
    pub index: usize,
    pub values: BTreeMap<String, String>,
}

impl ParsedRow {
    pub fn get(&self, header: &str) -> Option<&str> {
        self.values.get(header).map(|s| s.as_str())
    }
}

/// Header list plus rows, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<ParsedRow>,
}

/// A typed record keyed by canonical field names. Null fields are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub index: usize,
    pub fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// A required field was missing or failed coercion.
    Invalid,
    /// The row's natural key already exists for this trial and data type.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRejection {
    pub row_index: usize,
    pub kind: RejectionKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    Partial,
    Error,
}

impl IngestStatus {
    /// Status from accepted/rejected counts.
    pub fn from_counts(accepted: usize, rejected: usize) -> Self {
        if accepted == 0 {
            IngestStatus::Error
        } else if rejected == 0 {
            IngestStatus::Success
        } else {
            IngestStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Success => "success",
            IngestStatus::Partial => "partial",
            IngestStatus::Error => "error",
        }
    }
}

impl FromStr for IngestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(IngestStatus::Success),
            "partial" => Ok(IngestStatus::Partial),
            "error" => Ok(IngestStatus::Error),
            other => Err(format!("unknown ingest status '{}'", other)),
        }
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub status: IngestStatus,
    pub data_type: DataType,
    pub trial_id: Option<String>,
    pub records_accepted: usize,
    pub records_rejected: usize,
    /// Rejections caused by natural-key collisions (subset of `records_rejected`).
    pub duplicates: usize,
    pub rejections: Vec<RowRejection>,
    pub unmapped_headers: Vec<String>,
    pub detail: String,
}

impl IngestionResult {
    /// A whole-call failure with nothing accepted.
    pub fn error(data_type: DataType, trial_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            status: IngestStatus::Error,
            data_type,
            trial_id,
            records_accepted: 0,
            records_rejected: 0,
            duplicates: 0,
            rejections: Vec::new(),
            unmapped_headers: Vec::new(),
            detail: detail.into(),
        }
    }
}

/// Append-only audit record, one per ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLogEntry {
    pub id: String,
    pub trial_id: Option<String>,
    pub filename: String,
    pub data_type: DataType,
    pub status: IngestStatus,
    pub records_accepted: i64,
    pub records_rejected: i64,
    pub detail: String,
    pub content_sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Per-trial, per-data-type flag recording whether data has been loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageFlag {
    pub trial_id: String,
    pub data_type: DataType,
    pub has_data: bool,
    pub last_updated: DateTime<Utc>,
}

/// A trial known to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_tags_round_trip_through_from_str() {
        for dt in DataType::ALL {
            assert_eq!(dt.as_str().parse::<DataType>().unwrap(), dt);
        }
        assert_eq!("Soil Health".parse::<DataType>().unwrap(), DataType::SoilHealth);
        assert!("weather".parse::<DataType>().is_err());
    }

    #[test]
    fn status_follows_counts() {
        assert_eq!(IngestStatus::from_counts(3, 0), IngestStatus::Success);
        assert_eq!(IngestStatus::from_counts(2, 1), IngestStatus::Partial);
        assert_eq!(IngestStatus::from_counts(0, 4), IngestStatus::Error);
        assert_eq!(IngestStatus::from_counts(0, 0), IngestStatus::Error);
    }

    #[test]
    fn field_values_serialize_as_plain_json() {
        let date = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(serde_json::to_string(&date).unwrap(), "\"2024-01-05\"");
        assert_eq!(serde_json::to_string(&FieldValue::Decimal(6.5)).unwrap(), "6.5");
        assert_eq!(serde_json::to_string(&FieldValue::Integer(4)).unwrap(), "4");
    }
}
