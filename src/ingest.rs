//! Ingestion orchestration.
//!
//! One call takes one uploaded file through the whole path:
//!
//! ```text
//! classify → parse → resolve trial id → normalize → load → audit log
//! ```
//!
//! Trial summaries branch off after classification and go through the
//! summary extractor instead. Structural failures become an `error`
//! result rather than an `Err`; every call, successful or not, appends one
//! entry to the upload log.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::classify::{classify_filename, classify_headers};
use crate::config::Config;
use crate::error::IngestError;
use crate::loader;
use crate::mapping::{ColumnMapping, MappingRegistry};
use crate::models::{
    DataType, FieldValue, IngestStatus, IngestionResult, UploadContent, UploadLogEntry,
};
use crate::normalize::{check_required_columns, coerce, normalize_table};
use crate::parse::{parse_grid, parse_table};
use crate::store::Store;
use crate::summary::extract_summary;
use crate::trial_id::{normalize_trial_id, resolve_trial_id};

/// Worksheet names tried first for trial summary workbooks.
const SUMMARY_SHEET_HINTS: &[&str] = &["trial summary", "summary", "trial info", "protocol"];

const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Values for fields left null after coercion, keyed by canonical
    /// field name.
    pub defaults: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub trial_id: Option<String>,
    pub data_type: Option<DataType>,
    pub filename: String,
    pub content: UploadContent,
    pub options: IngestOptions,
}

impl IngestRequest {
    pub fn new(filename: impl Into<String>, content: UploadContent) -> Self {
        Self {
            trial_id: None,
            data_type: None,
            filename: filename.into(),
            content,
            options: IngestOptions::default(),
        }
    }

    pub fn trial(mut self, trial_id: impl Into<String>) -> Self {
        self.trial_id = Some(trial_id.into());
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.options.defaults.insert(field.into(), value);
        self
    }
}

/// What is known about a call so far; reported even when it fails.
#[derive(Debug, Clone)]
struct Resolved {
    data_type: DataType,
    trial_id: Option<String>,
}

/// Drives ingestion against a [`Store`]. Cheap to share across tasks.
pub struct Ingestor {
    store: Arc<dyn Store>,
    registry: &'static MappingRegistry,
    max_upload_bytes: usize,
    defaults: BTreeMap<String, FieldValue>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: MappingRegistry::builtin(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            defaults: BTreeMap::new(),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &Config) -> Self {
        Self::new(store)
            .with_max_upload_bytes(config.ingest.max_upload_bytes)
            .with_defaults(config.ingest.defaults.clone())
    }

    pub fn with_registry(mut self, registry: &'static MappingRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    /// Defaults applied to every call. Per-request defaults win.
    pub fn with_defaults(mut self, defaults: BTreeMap<String, FieldValue>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Ingest one file. Never fails; structural problems come back as a
    /// result with `status: error` and the reason in `detail`.
    pub async fn ingest(&self, request: IngestRequest) -> IngestionResult {
        let content_sha256 = hex::encode(Sha256::digest(request.content.as_bytes()));
        let mut resolved = Resolved {
            data_type: request.data_type.unwrap_or(DataType::Unknown),
            trial_id: None,
        };

        let result = match self.run(&request, &mut resolved).await {
            Ok(result) => result,
            Err(err) => {
                tracing::info!(
                    filename = %request.filename,
                    data_type = %resolved.data_type,
                    error = %err,
                    "ingestion failed"
                );
                IngestionResult::error(resolved.data_type, resolved.trial_id.clone(), err.to_string())
            }
        };

        self.record(&request.filename, &result, content_sha256).await;
        result
    }

    async fn run(
        &self,
        request: &IngestRequest,
        resolved: &mut Resolved,
    ) -> Result<IngestionResult, IngestError> {
        let size = request.content.len();
        if size > self.max_upload_bytes {
            return Err(IngestError::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        resolved.data_type = request
            .data_type
            .unwrap_or_else(|| classify_filename(&request.filename));
        resolved.trial_id = request.trial_id.as_deref().and_then(normalize_trial_id);

        match resolved.data_type {
            DataType::TrialSummary => return self.run_summary(request, resolved).await,
            DataType::Photo => {
                return Err(IngestError::NotTabular {
                    data_type: DataType::Photo,
                })
            }
            _ => {}
        }

        let hints = self
            .registry
            .get(resolved.data_type)
            .map(|m| m.sheet_hints)
            .unwrap_or(&[]);
        let table = parse_table(&request.content, hints)?;

        if resolved.data_type == DataType::Unknown {
            resolved.data_type = classify_headers(self.registry, &table.headers);
            tracing::debug!(
                filename = %request.filename,
                data_type = %resolved.data_type,
                "classified by headers"
            );
        }
        let mapping = match self.registry.get(resolved.data_type) {
            Some(mapping) => mapping,
            None if resolved.data_type == DataType::Unknown => {
                return Err(IngestError::UnknownDataType {
                    filename: request.filename.clone(),
                })
            }
            None => {
                return Err(IngestError::NotTabular {
                    data_type: resolved.data_type,
                })
            }
        };

        if resolved.trial_id.is_none() {
            resolved.trial_id = resolve_trial_id(&table, mapping);
        }
        let trial_id = resolved.trial_id.clone().ok_or(IngestError::MissingTrialId)?;

        let binding = mapping.bind(&table.headers);
        let mut merged = self.defaults.clone();
        merged.extend(request.options.defaults.clone());
        let defaults = typed_defaults(mapping, &merged);
        check_required_columns(mapping, &binding, &defaults)?;
        if table.rows.is_empty() {
            return Err(IngestError::Empty);
        }

        let normalized = normalize_table(&table, mapping, &binding, &defaults);
        let report = loader::load(self.store.as_ref(), &trial_id, mapping, normalized.accepted).await?;

        let duplicates = report.duplicates.len();
        let mut rejections = normalized.rejected;
        rejections.extend(report.duplicates);
        rejections.sort_by_key(|r| r.row_index);

        let accepted = report.inserted;
        let rejected = rejections.len();
        let status = IngestStatus::from_counts(accepted, rejected);
        let detail = format!(
            "{} accepted, {} rejected ({} duplicates)",
            accepted, rejected, duplicates
        );

        tracing::info!(
            filename = %request.filename,
            trial_id = %trial_id,
            data_type = %mapping.data_type,
            %status,
            accepted,
            rejected,
            "ingested"
        );

        Ok(IngestionResult {
            status,
            data_type: mapping.data_type,
            trial_id: Some(trial_id),
            records_accepted: accepted,
            records_rejected: rejected,
            duplicates,
            rejections,
            unmapped_headers: normalized.unmapped_headers,
            detail,
        })
    }

    async fn run_summary(
        &self,
        request: &IngestRequest,
        resolved: &mut Resolved,
    ) -> Result<IngestionResult, IngestError> {
        let grid = parse_grid(&request.content, SUMMARY_SHEET_HINTS)?;
        let summary = extract_summary(&grid);
        if summary.is_empty() {
            return Err(IngestError::EmptySummary);
        }

        if resolved.trial_id.is_none() {
            resolved.trial_id = summary.trial_id();
        }
        let trial_id = resolved.trial_id.clone().ok_or(IngestError::MissingTrialId)?;
        if !self.store.trial_exists(&trial_id).await? {
            return Err(IngestError::TrialNotFound { trial_id });
        }

        self.store.save_trial_summary(&trial_id, &summary).await?;

        tracing::info!(
            filename = %request.filename,
            trial_id = %trial_id,
            fields = summary.metadata.len(),
            treatments = summary.treatments.len(),
            "ingested trial summary"
        );

        Ok(IngestionResult {
            status: IngestStatus::Success,
            data_type: DataType::TrialSummary,
            trial_id: Some(trial_id),
            records_accepted: summary.record_count(),
            records_rejected: 0,
            duplicates: 0,
            rejections: Vec::new(),
            unmapped_headers: Vec::new(),
            detail: format!(
                "{} metadata fields, {} treatments",
                summary.metadata.len(),
                summary.treatments.len()
            ),
        })
    }

    /// Append the audit entry. A failure here must not change the result.
    async fn record(&self, filename: &str, result: &IngestionResult, content_sha256: String) {
        let entry = UploadLogEntry {
            id: Uuid::new_v4().to_string(),
            trial_id: result.trial_id.clone(),
            filename: filename.to_string(),
            data_type: result.data_type,
            status: result.status,
            records_accepted: result.records_accepted as i64,
            records_rejected: result.records_rejected as i64,
            detail: result.detail.clone(),
            content_sha256,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_upload_log(&entry).await {
            tracing::warn!(filename, error = %e, "failed to append upload log entry");
        }
    }
}

/// Text defaults (from the CLI or config) are coerced to the field's
/// declared type; values that do not coerce are kept as given.
fn typed_defaults(
    mapping: &ColumnMapping,
    defaults: &BTreeMap<String, FieldValue>,
) -> BTreeMap<String, FieldValue> {
    defaults
        .iter()
        .map(|(name, value)| {
            let typed = match (value, mapping.field(name)) {
                (FieldValue::Text(raw), Some(spec)) => {
                    coerce(raw, spec.field_type).unwrap_or_else(|| value.clone())
                }
                _ => value.clone(),
            };
            (name.clone(), typed)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn ingestor() -> (Arc<InMemoryStore>, Ingestor) {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone());
        (store, ingestor)
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_before_parsing() {
        let (store, ingestor) = ingestor();
        let ingestor = ingestor.with_max_upload_bytes(8);
        let request = IngestRequest::new(
            "Plot Data.csv",
            UploadContent::Text("Plot,Yield\n1,2\n".into()),
        )
        .trial("T-1");
        let result = ingestor.ingest(request).await;
        assert_eq!(result.status, IngestStatus::Error);
        assert!(result.detail.contains("byte limit"), "{}", result.detail);

        let log = store.upload_log(None, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, IngestStatus::Error);
    }

    #[tokio::test]
    async fn photos_are_not_tabular() {
        let (_, ingestor) = ingestor();
        let request = IngestRequest::new("plot 101.jpg", UploadContent::Binary(vec![0xFF, 0xD8]));
        let result = ingestor.ingest(request).await;
        assert_eq!(result.status, IngestStatus::Error);
        assert_eq!(result.data_type, DataType::Photo);
        assert!(result.detail.contains("not tabular"));
    }

    #[tokio::test]
    async fn missing_trial_id_is_explained() {
        let (_, ingestor) = ingestor();
        let request = IngestRequest::new(
            "Plot Data.csv",
            UploadContent::Text("Plot,Yield\n101,55\n".into()),
        );
        let result = ingestor.ingest(request).await;
        assert_eq!(result.status, IngestStatus::Error);
        assert!(result.detail.contains("Trial ID column"), "{}", result.detail);
    }

    #[tokio::test]
    async fn text_defaults_follow_field_types() {
        let (store, ingestor) = ingestor();
        store.register_trial("T-1", None).await.unwrap();
        let request = IngestRequest::new(
            "Plot Data.csv",
            UploadContent::Text("Plot,Yield\n101,55\n".into()),
        )
        .trial("t-1")
        .default_value("replication", FieldValue::Text("2".into()))
        .default_value("assessment_date", FieldValue::Text("45000".into()));
        let result = ingestor.ingest(request).await;
        assert_eq!(result.status, IngestStatus::Success, "{}", result.detail);

        let rows = store.rows("T-1", DataType::PlotData).await.unwrap();
        assert_eq!(rows[0].fields["replication"], serde_json::json!(2));
        assert_eq!(rows[0].fields["assessment_date"], serde_json::json!("2023-03-15"));
    }

    #[tokio::test]
    async fn request_defaults_override_configured_ones() {
        let store = Arc::new(InMemoryStore::new());
        store.register_trial("T-1", None).await.unwrap();
        let mut configured = BTreeMap::new();
        configured.insert("replication".to_string(), FieldValue::Integer(1));
        configured.insert("treatment".to_string(), FieldValue::Text("Check".into()));
        let ingestor = Ingestor::new(store.clone()).with_defaults(configured);

        let request = IngestRequest::new(
            "Plot Data.csv",
            UploadContent::Text("Plot,Yield\n101,55\n".into()),
        )
        .trial("T-1")
        .default_value("replication", FieldValue::Integer(3));
        let result = ingestor.ingest(request).await;
        assert_eq!(result.status, IngestStatus::Success, "{}", result.detail);

        let rows = store.rows("T-1", DataType::PlotData).await.unwrap();
        assert_eq!(rows[0].fields["replication"], serde_json::json!(3));
        assert_eq!(rows[0].fields["treatment"], serde_json::json!("Check"));
    }
}
