//! Coverage and upload-log reports.
//!
//! Used by `fti coverage` and `fti log` to show what has been loaded for a
//! trial and what happened to recent uploads. Reports are rendered to a
//! `String` so they can be tested; the CLI prints them to stdout.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::models::{DataType, IngestStatus, UploadLogEntry};
use crate::store::Store;

/// Render the coverage table for one trial: every tabular data type plus
/// the trial summary, with row counts and flag state.
pub async fn coverage_report(store: &dyn Store, trial_id: &str) -> Result<String> {
    if !store.trial_exists(trial_id).await? {
        bail!("Trial not found: {}", trial_id);
    }
    let flags = store.coverage(trial_id).await?;

    let mut out = String::new();
    writeln!(out, "Trial {} coverage", trial_id)?;
    writeln!(out, "{}", "=".repeat(15 + trial_id.len()))?;
    writeln!(out)?;
    writeln!(
        out,
        "  {:<18} {:>8} {:>6}   {}",
        "DATA TYPE", "ROWS", "DATA", "UPDATED"
    )?;
    writeln!(out, "  {}", "-".repeat(60))?;

    for data_type in DataType::ALL {
        if !data_type.is_tabular() && data_type != DataType::TrialSummary {
            continue;
        }
        let flag = flags.iter().find(|f| f.data_type == data_type);
        let rows = if data_type == DataType::TrialSummary {
            store
                .trial_summary(trial_id)
                .await?
                .map(|s| s.record_count() as u64)
                .unwrap_or(0)
        } else {
            store.row_count(trial_id, data_type).await?
        };
        let (has_data, updated) = match flag {
            Some(f) => (
                if f.has_data { "yes" } else { "no" },
                format_relative(f.last_updated),
            ),
            None => ("-", "never".to_string()),
        };
        writeln!(
            out,
            "  {:<18} {:>8} {:>6}   {}",
            data_type.as_str(),
            rows,
            has_data,
            updated
        )?;
    }
    Ok(out)
}

/// Render the most recent upload log entries, newest first.
pub async fn log_report(store: &dyn Store, trial_id: Option<&str>, limit: usize) -> Result<String> {
    let entries = store.upload_log(trial_id, limit).await?;

    let mut out = String::new();
    if entries.is_empty() {
        writeln!(out, "No uploads recorded.")?;
        return Ok(out);
    }
    writeln!(
        out,
        "  {:<16} {:<10} {:<16} {:<8} {:>6} {:>6}  {}",
        "WHEN", "TRIAL", "TYPE", "STATUS", "OK", "REJ", "FILE"
    )?;
    writeln!(out, "  {}", "-".repeat(90))?;
    for entry in &entries {
        write_log_line(&mut out, entry)?;
    }
    Ok(out)
}

fn write_log_line(out: &mut String, entry: &UploadLogEntry) -> std::fmt::Result {
    writeln!(
        out,
        "  {:<16} {:<10} {:<16} {:<8} {:>6} {:>6}  {}",
        format_relative(entry.created_at),
        entry.trial_id.as_deref().unwrap_or("-"),
        entry.data_type.as_str(),
        entry.status.as_str(),
        entry.records_accepted,
        entry.records_rejected,
        entry.filename
    )?;
    if entry.status == IngestStatus::Error {
        writeln!(out, "      {}", entry.detail)?;
    }
    Ok(())
}

/// Format a timestamp as a relative time string (e.g. "3 hours ago").
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = Utc::now().timestamp() - ts.timestamp();

    if delta < 0 {
        return format_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_iso(ts)
    }
}

fn format_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}
