use anyhow::Result;
use sqlx::SqlitePool;

/// Create every table and index if missing. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trials (
            id TEXT PRIMARY KEY,
            name TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One JSON document per accepted row, for every tabular data type
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trial_rows (
            id TEXT PRIMARY KEY,
            trial_id TEXT NOT NULL,
            data_type TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            fields_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(trial_id, data_type, natural_key),
            FOREIGN KEY (trial_id) REFERENCES trials(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_coverage (
            trial_id TEXT NOT NULL,
            data_type TEXT NOT NULL,
            has_data INTEGER NOT NULL DEFAULT 0,
            last_updated INTEGER NOT NULL,
            PRIMARY KEY (trial_id, data_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // trial_id is NULL when the call failed before a trial was resolved
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_log (
            id TEXT PRIMARY KEY,
            trial_id TEXT,
            filename TEXT NOT NULL,
            data_type TEXT NOT NULL,
            status TEXT NOT NULL,
            records_accepted INTEGER NOT NULL,
            records_rejected INTEGER NOT NULL,
            detail TEXT NOT NULL DEFAULT '',
            content_sha256 TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trial_metadata (
            trial_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (trial_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trial_treatments (
            trial_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            number INTEGER,
            attributes_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (trial_id, position)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_trial_rows_slot ON trial_rows(trial_id, data_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_upload_log_trial ON upload_log(trial_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_upload_log_created_at ON upload_log(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
