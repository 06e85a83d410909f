//! Directory ingestion.
//!
//! Walks a directory, keeps files matching the configured include globs
//! and not matching the exclude globs, and ingests each one in sorted
//! path order. One unreadable file does not stop the batch.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::ingest::{IngestRequest, Ingestor};
use crate::models::{DataType, IngestStatus, IngestionResult};
use crate::parse::decode_upload;

/// A file selected for ingestion.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub path: PathBuf,
    /// Path relative to the walked root, `/`-separated.
    pub relative: String,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub file: BatchFile,
    pub result: IngestionResult,
}

/// Totals over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTotals {
    pub files: usize,
    pub success: usize,
    pub partial: usize,
    pub error: usize,
    pub records_accepted: usize,
    pub records_rejected: usize,
}

impl BatchTotals {
    pub fn from_items(items: &[BatchItem]) -> Self {
        let mut totals = BatchTotals {
            files: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.result.status {
                IngestStatus::Success => totals.success += 1,
                IngestStatus::Partial => totals.partial += 1,
                IngestStatus::Error => totals.error += 1,
            }
            totals.records_accepted += item.result.records_accepted;
            totals.records_rejected += item.result.records_rejected;
        }
        totals
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// List matching files under `root`, sorted by relative path.
pub fn scan_dir(root: &Path, config: &IngestConfig) -> Result<Vec<BatchFile>> {
    if !root.is_dir() {
        bail!("Not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string(), "**/~$*".to_string()];
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        files.push(BatchFile {
            path: path.to_path_buf(),
            relative,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Ingest every matching file under `root`.
pub async fn ingest_dir(
    ingestor: &Ingestor,
    root: &Path,
    config: &IngestConfig,
    trial_id: Option<&str>,
    data_type: Option<DataType>,
) -> Result<Vec<BatchItem>> {
    let files = scan_dir(root, config)?;
    tracing::info!(root = %root.display(), files = files.len(), "ingesting directory");

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        let filename = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.relative.clone());

        let result = match std::fs::read(&file.path) {
            Ok(bytes) => match decode_upload(&filename, bytes) {
                Ok(content) => {
                    let mut request = IngestRequest::new(filename, content);
                    request.trial_id = trial_id.map(str::to_string);
                    request.data_type = data_type;
                    ingestor.ingest(request).await
                }
                Err(e) => IngestionResult::error(
                    data_type.unwrap_or(DataType::Unknown),
                    None,
                    e.to_string(),
                ),
            },
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "failed to read file");
                IngestionResult::error(
                    data_type.unwrap_or(DataType::Unknown),
                    None,
                    format!("failed to read file: {}", e),
                )
            }
        };
        items.push(BatchItem { file, result });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::Store;
    use std::sync::Arc;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn scan_applies_globs_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/Plot Data.csv", "x");
        write(dir.path(), "a/Soil Health.csv", "x");
        write(dir.path(), "a/notes.md", "x");
        write(dir.path(), "a/~$Soil Health.xlsx", "x");
        write(dir.path(), "skip/Plot Data.csv", "x");

        let config = IngestConfig {
            exclude_globs: vec!["skip/**".to_string()],
            ..IngestConfig::default()
        };
        let files = scan_dir(dir.path(), &config).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a/Soil Health.csv", "b/Plot Data.csv"]);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_dir(&dir.path().join("nope"), &IngestConfig::default()).is_err());
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Plot Data.csv", "Plot,Yield\n101,55\n102,60\n");
        write(dir.path(), "mystery.csv", "foo,bar\n1,2\n");

        let store = Arc::new(InMemoryStore::new());
        store.register_trial("T-7", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());

        let items = ingest_dir(&ingestor, dir.path(), &IngestConfig::default(), Some("T-7"), None)
            .await
            .unwrap();
        let totals = BatchTotals::from_items(&items);
        assert_eq!(totals.files, 2);
        assert_eq!(totals.success, 1);
        assert_eq!(totals.error, 1);
        assert_eq!(totals.records_accepted, 2);
        assert_eq!(store.upload_log(Some("T-7"), 10).await.unwrap().len(), 2);
    }
}
