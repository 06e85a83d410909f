//! Idempotent loading of normalized rows.
//!
//! Every row gets a natural key built from its mapping's key fields and a
//! row id hashed from `(trial, data type, natural key)`. The store refuses
//! keys it already holds, so loading the same file twice inserts nothing
//! the second time.

use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::mapping::ColumnMapping;
use crate::models::{NormalizedRow, RejectionKind, RowRejection};
use crate::store::{StagedRow, Store};

/// Separates natural-key parts; cannot appear in spreadsheet text.
const KEY_SEPARATOR: char = '\u{1f}';

/// Rows accepted and refused by one load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub inserted: usize,
    pub duplicates: Vec<RowRejection>,
}

/// Canonical text of the row's natural-key fields. Absent fields
/// contribute an empty part so positions stay aligned.
pub fn natural_key(mapping: &ColumnMapping, row: &NormalizedRow) -> String {
    mapping
        .natural_key
        .iter()
        .map(|field| row.get(field).map(|v| v.key_text()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

/// Hex SHA-256 over trial, data type and natural key.
pub fn row_id(trial_id: &str, mapping: &ColumnMapping, natural_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trial_id.as_bytes());
    hasher.update([KEY_SEPARATOR as u8]);
    hasher.update(mapping.data_type.as_str().as_bytes());
    hasher.update([KEY_SEPARATOR as u8]);
    hasher.update(natural_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn stage_rows(
    trial_id: &str,
    mapping: &ColumnMapping,
    rows: Vec<NormalizedRow>,
) -> Vec<StagedRow> {
    rows.into_iter()
        .map(|row| {
            let natural_key = natural_key(mapping, &row);
            StagedRow {
                index: row.index,
                row_id: row_id(trial_id, mapping, &natural_key),
                natural_key,
                fields: row.fields,
            }
        })
        .collect()
}

/// Persist `rows` for `trial_id`. Rows whose natural key is already stored
/// (or repeats earlier in the same batch) come back as duplicates.
pub async fn load(
    store: &dyn Store,
    trial_id: &str,
    mapping: &ColumnMapping,
    rows: Vec<NormalizedRow>,
) -> Result<LoadReport, IngestError> {
    if !store.trial_exists(trial_id).await? {
        return Err(IngestError::TrialNotFound {
            trial_id: trial_id.to_string(),
        });
    }

    let staged = stage_rows(trial_id, mapping, rows);
    let outcome = store.load_rows(trial_id, mapping.data_type, &staged).await?;

    let duplicates = outcome
        .conflicts
        .iter()
        .map(|index| RowRejection {
            row_index: *index,
            kind: RejectionKind::Duplicate,
            reason: format!("row {}: duplicate", index),
        })
        .collect();

    tracing::debug!(
        trial_id,
        data_type = %mapping.data_type,
        inserted = outcome.inserted,
        conflicts = outcome.conflicts.len(),
        "loaded rows"
    );

    Ok(LoadReport {
        inserted: outcome.inserted,
        duplicates,
    })
}
