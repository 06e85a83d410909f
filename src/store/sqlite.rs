//! SQLite-backed [`Store`] implementation.
//!
//! Rows are kept as JSON documents in `trial_rows`, one table for every
//! data type. The `UNIQUE(trial_id, data_type, natural_key)` constraint is
//! what makes re-ingestion idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{CoverageFlag, DataType, Trial, UploadLogEntry};
use crate::summary::{Treatment, TrialSummary};
use crate::trial_id::normalize_trial_id;

use super::{canonical_trial_id, LoadOutcome, StagedRow, Store, StoredRow};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and bring its schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn parse_data_type(raw: &str) -> Result<DataType> {
    raw.parse::<DataType>().map_err(anyhow::Error::msg)
}

async fn upsert_coverage<'c, E>(
    executor: E,
    trial_id: &str,
    data_type: DataType,
    has_data: bool,
) -> Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO data_coverage (trial_id, data_type, has_data, last_updated)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(trial_id, data_type) DO UPDATE SET
            has_data = excluded.has_data,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(trial_id)
    .bind(data_type.as_str())
    .bind(has_data)
    .bind(Utc::now().timestamp())
    .execute(executor)
    .await?;
    Ok(())
}

fn log_entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UploadLogEntry> {
    let data_type: String = row.get("data_type");
    let status: String = row.get("status");
    Ok(UploadLogEntry {
        id: row.get("id"),
        trial_id: row.get("trial_id"),
        filename: row.get("filename"),
        data_type: parse_data_type(&data_type)?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        records_accepted: row.get("records_accepted"),
        records_rejected: row.get("records_rejected"),
        detail: row.get("detail"),
        content_sha256: row.get("content_sha256"),
        created_at: from_ts(row.get("created_at")),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn register_trial(&self, trial_id: &str, name: Option<&str>) -> Result<bool> {
        let trial_id = canonical_trial_id(trial_id)?;
        let result = sqlx::query(
            "INSERT INTO trials (id, name, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(trial_id)
        .bind(name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn trial_exists(&self, trial_id: &str) -> Result<bool> {
        let Some(trial_id) = normalize_trial_id(trial_id) else {
            return Ok(false);
        };
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trials WHERE id = ?")
            .bind(trial_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn trials(&self) -> Result<Vec<Trial>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM trials ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Trial {
                id: r.get("id"),
                name: r.get("name"),
                created_at: from_ts(r.get("created_at")),
            })
            .collect())
    }

    async fn load_rows(
        &self,
        trial_id: &str,
        data_type: DataType,
        rows: &[StagedRow],
    ) -> Result<LoadOutcome> {
        let now = Utc::now().timestamp();
        let mut outcome = LoadOutcome::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let fields_json = serde_json::to_string(&row.fields)?;
            let result = sqlx::query(
                r#"
                INSERT INTO trial_rows (id, trial_id, data_type, natural_key, row_index,
                                        fields_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&row.row_id)
            .bind(trial_id)
            .bind(data_type.as_str())
            .bind(&row.natural_key)
            .bind(row.index as i64)
            .bind(&fields_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                outcome.conflicts.push(row.index);
            } else {
                outcome.inserted += 1;
            }
        }

        if outcome.inserted > 0 {
            upsert_coverage(&mut *tx, trial_id, data_type, true).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn save_trial_summary(&self, trial_id: &str, summary: &TrialSummary) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM trial_metadata WHERE trial_id = ?")
            .bind(trial_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trial_treatments WHERE trial_id = ?")
            .bind(trial_id)
            .execute(&mut *tx)
            .await?;

        for (key, value) in &summary.metadata {
            sqlx::query("INSERT INTO trial_metadata (trial_id, key, value) VALUES (?, ?, ?)")
                .bind(trial_id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        for (position, treatment) in summary.treatments.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO trial_treatments (trial_id, position, number, attributes_json)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(trial_id)
            .bind(position as i64)
            .bind(treatment.number)
            .bind(serde_json::to_string(&treatment.attributes)?)
            .execute(&mut *tx)
            .await?;
        }

        upsert_coverage(&mut *tx, trial_id, DataType::TrialSummary, true).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn trial_summary(&self, trial_id: &str) -> Result<Option<TrialSummary>> {
        let metadata_rows = sqlx::query("SELECT key, value FROM trial_metadata WHERE trial_id = ?")
            .bind(trial_id)
            .fetch_all(&self.pool)
            .await?;
        let treatment_rows = sqlx::query(
            "SELECT number, attributes_json FROM trial_treatments WHERE trial_id = ? ORDER BY position",
        )
        .bind(trial_id)
        .fetch_all(&self.pool)
        .await?;

        if metadata_rows.is_empty() && treatment_rows.is_empty() {
            return Ok(None);
        }

        let mut summary = TrialSummary::default();
        for row in &metadata_rows {
            summary.metadata.insert(row.get("key"), row.get("value"));
        }
        for row in &treatment_rows {
            let attributes: String = row.get("attributes_json");
            summary.treatments.push(Treatment {
                number: row.get("number"),
                attributes: serde_json::from_str(&attributes)
                    .context("corrupt treatment attributes")?,
            });
        }
        Ok(Some(summary))
    }

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_log (id, trial_id, filename, data_type, status,
                                    records_accepted, records_rejected, detail,
                                    content_sha256, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.trial_id)
        .bind(&entry.filename)
        .bind(entry.data_type.as_str())
        .bind(entry.status.as_str())
        .bind(entry.records_accepted)
        .bind(entry.records_rejected)
        .bind(&entry.detail)
        .bind(&entry.content_sha256)
        .bind(entry.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upload_log(
        &self,
        trial_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UploadLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trial_id, filename, data_type, status, records_accepted,
                   records_rejected, detail, content_sha256, created_at
            FROM upload_log
            WHERE (?1 IS NULL OR trial_id = ?1)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(trial_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_entry_from_row).collect()
    }

    async fn coverage(&self, trial_id: &str) -> Result<Vec<CoverageFlag>> {
        let rows = sqlx::query(
            "SELECT data_type, has_data, last_updated FROM data_coverage WHERE trial_id = ?",
        )
        .bind(trial_id)
        .fetch_all(&self.pool)
        .await?;

        let mut flags = Vec::with_capacity(rows.len());
        for row in &rows {
            let data_type: String = row.get("data_type");
            flags.push(CoverageFlag {
                trial_id: trial_id.to_string(),
                data_type: parse_data_type(&data_type)?,
                has_data: row.get("has_data"),
                last_updated: from_ts(row.get("last_updated")),
            });
        }
        flags.sort_by_key(|f| f.data_type);
        Ok(flags)
    }

    async fn row_count(&self, trial_id: &str, data_type: DataType) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM trial_rows WHERE trial_id = ? AND data_type = ?")
                .bind(trial_id)
                .bind(data_type.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn rows(&self, trial_id: &str, data_type: DataType) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query(
            r#"
            SELECT natural_key, fields_json FROM trial_rows
            WHERE trial_id = ? AND data_type = ?
            ORDER BY rowid
            "#,
        )
        .bind(trial_id)
        .bind(data_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let fields: String = row.get("fields_json");
            out.push(StoredRow {
                natural_key: row.get("natural_key"),
                fields: serde_json::from_str(&fields).context("corrupt stored row")?,
            });
        }
        Ok(out)
    }

    async fn delete_rows(&self, trial_id: &str, data_type: DataType) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM trial_rows WHERE trial_id = ? AND data_type = ?")
            .bind(trial_id)
            .bind(data_type.as_str())
            .execute(&mut *tx)
            .await?;
        upsert_coverage(&mut *tx, trial_id, data_type, false).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
