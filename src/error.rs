//! Error types for ingestion and GIS normalization.
//!
//! Structural failures abort a whole call. Row-level problems are not
//! errors; they are reported as [`RowRejection`](crate::models::RowRejection)s.

use thiserror::Error;

use crate::models::DataType;

/// Failure to turn raw bytes into a table.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("file is not valid UTF-8 text: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("malformed delimited text: {0}")]
    Csv(#[from] csv::Error),

    #[error("unreadable workbook: {0}")]
    Workbook(String),

    #[error("legacy .xls workbooks are not supported; save the file as .xlsx")]
    LegacyWorkbook,

    #[error("no header row found")]
    NoHeader,
}

/// Structural ingestion failure.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("upload is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("could not determine the data type of '{filename}'; pass it explicitly")]
    UnknownDataType { filename: String },

    #[error("{data_type} uploads are not tabular data and cannot be ingested")]
    NotTabular { data_type: DataType },

    #[error("required column '{field}' not found; accepted headers: {accepted}")]
    MissingColumn { field: String, accepted: String },

    #[error("no trial identifier supplied and none found in the file; pass a trial id or add a Trial ID column")]
    MissingTrialId,

    #[error("trial not found: {trial_id}")]
    TrialNotFound { trial_id: String },

    #[error("no data rows found")]
    Empty,

    #[error("no trial summary fields or treatment table recognized")]
    EmptySummary,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Structural failure while normalizing a GIS file.
#[derive(Error, Debug)]
pub enum GisError {
    #[error("unsupported GIS file type: '{filename}' (expected .geojson, .json, .kml, .kmz, .zip or .shp)")]
    UnsupportedExtension { filename: String },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported GeoJSON root type: {0}")]
    UnsupportedRoot(String),

    #[error("KML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("KML document ends inside unclosed <{0}>")]
    Truncated(String),

    #[error("KML is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive contains no {0} member")]
    MissingMember(&'static str),

    #[error("archive member {name} exceeds size limit ({limit} bytes)")]
    MemberTooLarge { name: String, limit: u64 },

    #[error("malformed shapefile {name}: {reason}")]
    Shapefile { name: String, reason: String },
}

impl GisError {
    pub fn shapefile(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Shapefile {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
