//! In-memory [`Store`] implementation for tests and embedders.
//!
//! Everything lives behind one `std::sync::RwLock`, so each trait method
//! is atomic with respect to the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{CoverageFlag, DataType, Trial, UploadLogEntry};
use crate::summary::TrialSummary;
use crate::trial_id::normalize_trial_id;

use super::{canonical_trial_id, LoadOutcome, StagedRow, Store, StoredRow};

type Slot = (String, DataType);

#[derive(Default)]
struct Inner {
    trials: BTreeMap<String, Trial>,
    keys: HashSet<(String, DataType, String)>,
    rows: HashMap<Slot, Vec<StoredRow>>,
    coverage: BTreeMap<Slot, CoverageFlag>,
    summaries: HashMap<String, TrialSummary>,
    log: Vec<UploadLogEntry>,
}

impl Inner {
    fn set_coverage(&mut self, trial_id: &str, data_type: DataType, has_data: bool) {
        self.coverage.insert(
            (trial_id.to_string(), data_type),
            CoverageFlag {
                trial_id: trial_id.to_string(),
                data_type,
                has_data,
                last_updated: Utc::now(),
            },
        );
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn register_trial(&self, trial_id: &str, name: Option<&str>) -> Result<bool> {
        let trial_id = canonical_trial_id(trial_id)?;
        let mut inner = self.write()?;
        if inner.trials.contains_key(&trial_id) {
            return Ok(false);
        }
        inner.trials.insert(
            trial_id.clone(),
            Trial {
                id: trial_id,
                name: name.map(str::to_string),
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn trial_exists(&self, trial_id: &str) -> Result<bool> {
        let Some(trial_id) = normalize_trial_id(trial_id) else {
            return Ok(false);
        };
        Ok(self.read()?.trials.contains_key(&trial_id))
    }

    async fn trials(&self) -> Result<Vec<Trial>> {
        Ok(self.read()?.trials.values().cloned().collect())
    }

    async fn load_rows(
        &self,
        trial_id: &str,
        data_type: DataType,
        rows: &[StagedRow],
    ) -> Result<LoadOutcome> {
        // Serialize everything first so a failure leaves the store untouched.
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            encoded.push(serde_json::to_value(&row.fields)?);
        }

        let mut inner = self.write()?;
        let mut outcome = LoadOutcome::default();
        for (row, fields) in rows.iter().zip(encoded) {
            let key = (trial_id.to_string(), data_type, row.natural_key.clone());
            if !inner.keys.insert(key) {
                outcome.conflicts.push(row.index);
                continue;
            }
            inner
                .rows
                .entry((trial_id.to_string(), data_type))
                .or_default()
                .push(StoredRow {
                    natural_key: row.natural_key.clone(),
                    fields,
                });
            outcome.inserted += 1;
        }
        if outcome.inserted > 0 {
            inner.set_coverage(trial_id, data_type, true);
        }
        Ok(outcome)
    }

    async fn save_trial_summary(&self, trial_id: &str, summary: &TrialSummary) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .summaries
            .insert(trial_id.to_string(), summary.clone());
        inner.set_coverage(trial_id, DataType::TrialSummary, true);
        Ok(())
    }

    async fn trial_summary(&self, trial_id: &str) -> Result<Option<TrialSummary>> {
        Ok(self.read()?.summaries.get(trial_id).cloned())
    }

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<()> {
        self.write()?.log.push(entry.clone());
        Ok(())
    }

    async fn upload_log(
        &self,
        trial_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UploadLogEntry>> {
        let inner = self.read()?;
        Ok(inner
            .log
            .iter()
            .rev()
            .filter(|e| trial_id.is_none() || e.trial_id.as_deref() == trial_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn coverage(&self, trial_id: &str) -> Result<Vec<CoverageFlag>> {
        Ok(self
            .read()?
            .coverage
            .values()
            .filter(|f| f.trial_id == trial_id)
            .cloned()
            .collect())
    }

    async fn row_count(&self, trial_id: &str, data_type: DataType) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&(trial_id.to_string(), data_type))
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn rows(&self, trial_id: &str, data_type: DataType) -> Result<Vec<StoredRow>> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&(trial_id.to_string(), data_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_rows(&self, trial_id: &str, data_type: DataType) -> Result<u64> {
        let mut inner = self.write()?;
        let removed = inner
            .rows
            .remove(&(trial_id.to_string(), data_type))
            .unwrap_or_default();
        inner
            .keys
            .retain(|(t, dt, _)| !(t == trial_id && *dt == data_type));
        inner.set_coverage(trial_id, data_type, false);
        Ok(removed.len() as u64)
    }
}
