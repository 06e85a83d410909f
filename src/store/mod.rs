//! Storage abstraction for trial data.
//!
//! The [`Store`] trait covers every persistence operation the ingestion
//! pipeline needs. Two backends ship with the crate:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteStore`](sqlite::SqliteStore) | The CLI and any long-lived deployment |
//! | [`InMemoryStore`](memory::InMemoryStore) | Tests and embedders without a database |
//!
//! Implementations must be `Send + Sync` so one store can back concurrent
//! ingestion calls. Duplicate detection relies solely on the backend's
//! uniqueness guarantee for `(trial_id, data_type, natural_key)`; callers
//! never lock around it.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{CoverageFlag, DataType, FieldValue, Trial, UploadLogEntry};
use crate::summary::TrialSummary;
use crate::trial_id::normalize_trial_id;

/// Trial ids are kept in canonical form so registration and lookups agree
/// with the ids ingestion resolves.
pub(crate) fn canonical_trial_id(raw: &str) -> Result<String> {
    normalize_trial_id(raw).ok_or_else(|| anyhow!("invalid trial id: '{}'", raw))
}

/// A normalized row ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    /// Source row index, echoed back for conflicts.
    pub index: usize,
    /// SHA-256 over `(trial, data type, natural key)`, hex-encoded.
    pub row_id: String,
    pub natural_key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Result of [`Store::load_rows`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOutcome {
    pub inserted: usize,
    /// Indexes of rows whose natural key already existed, in input order.
    pub conflicts: Vec<usize>,
}

/// A persisted row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub natural_key: String,
    pub fields: serde_json::Value,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`load_rows`](Store::load_rows) | Insert rows, skip known natural keys, raise coverage (atomic) |
/// | [`save_trial_summary`](Store::save_trial_summary) | Replace a trial's summary, raise coverage |
/// | [`append_upload_log`](Store::append_upload_log) | Record one ingestion attempt |
/// | [`delete_rows`](Store::delete_rows) | Remove a data type's rows for a trial, lower coverage |
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a trial under its canonical id. Returns `false` when it
    /// already existed.
    async fn register_trial(&self, trial_id: &str, name: Option<&str>) -> Result<bool>;

    async fn trial_exists(&self, trial_id: &str) -> Result<bool>;

    async fn trials(&self) -> Result<Vec<Trial>>;

    /// Insert `rows` unless their natural key is already stored, and raise
    /// the `(trial, data_type)` coverage flag when at least one row went in.
    ///
    /// All-or-nothing: on error neither rows nor the flag are written.
    async fn load_rows(
        &self,
        trial_id: &str,
        data_type: DataType,
        rows: &[StagedRow],
    ) -> Result<LoadOutcome>;

    /// Replace the trial's metadata and treatments and raise the
    /// `trial_summary` coverage flag, atomically.
    async fn save_trial_summary(&self, trial_id: &str, summary: &TrialSummary) -> Result<()>;

    async fn trial_summary(&self, trial_id: &str) -> Result<Option<TrialSummary>>;

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<()>;

    /// Most recent entries first, optionally restricted to one trial.
    async fn upload_log(&self, trial_id: Option<&str>, limit: usize)
        -> Result<Vec<UploadLogEntry>>;

    /// Coverage flags of one trial, ordered by data type.
    async fn coverage(&self, trial_id: &str) -> Result<Vec<CoverageFlag>>;

    async fn row_count(&self, trial_id: &str, data_type: DataType) -> Result<u64>;

    /// Stored rows of one trial and type, in insertion order.
    async fn rows(&self, trial_id: &str, data_type: DataType) -> Result<Vec<StoredRow>>;

    /// Delete a data type's rows for a trial and reset its coverage flag to
    /// `false`. Returns the number of rows removed.
    async fn delete_rows(&self, trial_id: &str, data_type: DataType) -> Result<u64>;
}
