//! Trial identifier detection and normalization.

use crate::mapping::ColumnMapping;
use crate::models::ParsedTable;

/// Cell values that mean "no value" in the sheets we receive.
const PLACEHOLDERS: &[&str] = &["n/a", "na", "-", "--", "none", "null", "tbd", "?"];

/// Canonical form of a trial identifier: trimmed, inner whitespace
/// collapsed, uppercased. Applied to detected ids, caller-supplied ids and
/// registered trials alike, so lookups agree.
pub fn normalize_trial_id(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || PLACEHOLDERS.contains(&collapsed.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(collapsed.to_uppercase())
}

/// Find the first usable trial identifier in `table`.
///
/// Candidates are tried in the mapping's priority order; within a
/// candidate column rows are scanned top to bottom. Returns `None` when no
/// candidate column holds a usable value; deciding what to do then is the
/// caller's job.
pub fn resolve_trial_id(table: &ParsedTable, mapping: &ColumnMapping) -> Option<String> {
    let binding = mapping.bind(&table.headers);
    mapping.trial_id_candidates.iter().find_map(|candidate| {
        let header = binding.header_for(candidate)?;
        table
            .rows
            .iter()
            .find_map(|row| row.get(header).and_then(normalize_trial_id))
    })
}
