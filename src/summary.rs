//! Trial summary extraction.
//!
//! Summary sheets are label/value forms, not tables: a row reading
//! `Crop: | Corn` records `crop = Corn`, and a treatment list may follow
//! somewhere below its own header row. Extraction works on the raw grid
//! so neither layout has to look like a header row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mapping::header_key;
use crate::normalize::{coerce_date, coerce_integer};
use crate::parse::{Grid, GridRow};
use crate::trial_id::normalize_trial_id;

/// Recognized labels → metadata key. `true` marks date-valued labels.
const LABELS: &[(&str, &str, bool)] = &[
    ("trial id", "trial_id", false),
    ("trial name", "trial_name", false),
    ("client", "client", false),
    ("sponsor", "sponsor", false),
    ("crop", "crop", false),
    ("variety", "variety", false),
    ("location", "location", false),
    ("cooperator", "cooperator", false),
    ("grower", "grower", false),
    ("planting date", "planting_date", true),
    ("harvest date", "harvest_date", true),
    ("start date", "start_date", true),
    ("end date", "end_date", true),
    ("trial type", "trial_type", false),
    ("design", "design", false),
    ("replications", "replications", false),
    ("plot size", "plot_size", false),
    ("investigator", "investigator", false),
    ("objective", "objective", false),
    ("notes", "notes", false),
];

/// Leading cell of a treatment table header row.
const TREATMENT_LEADS: &[&str] = &[
    "trt",
    "trt no",
    "trt #",
    "treatment",
    "treatment no",
    "treatment number",
];

/// At least one of these must appear elsewhere in the header row.
const TREATMENT_COLUMNS: &[&str] = &["product", "description", "treatment name", "rate"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    /// Treatment number when the leading cell is an integer.
    pub number: Option<i64>,
    /// Remaining cells keyed by their normalized column header.
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub metadata: BTreeMap<String, String>,
    pub treatments: Vec<Treatment>,
}

impl TrialSummary {
    /// Recognized metadata fields plus treatments.
    pub fn record_count(&self) -> usize {
        self.metadata.len() + self.treatments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Normalized trial id from the `Trial ID` label, if present.
    pub fn trial_id(&self) -> Option<String> {
        self.metadata
            .get("trial_id")
            .and_then(|v| normalize_trial_id(v))
    }
}

/// Lowercase, whitespace-collapsed, trailing colon removed.
fn label_text(cell: &str) -> String {
    let collapsed = cell
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.trim_end_matches(':').trim_end().to_string()
}

fn non_empty_cells(row: &GridRow) -> impl Iterator<Item = (usize, &str)> {
    row.cells
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.trim()))
        .filter(|(_, c)| !c.is_empty())
}

fn treatment_header(row: &GridRow) -> Option<Vec<(usize, String)>> {
    let lead = label_text(row.cell(0));
    if !TREATMENT_LEADS.contains(&lead.as_str()) {
        return None;
    }
    let has_column = row
        .cells
        .iter()
        .skip(1)
        .any(|c| TREATMENT_COLUMNS.contains(&label_text(c).as_str()));
    if !has_column {
        return None;
    }
    Some(
        non_empty_cells(row)
            .map(|(i, c)| (i, header_key(c)))
            .collect(),
    )
}

fn treatment_row(columns: &[(usize, String)], row: &GridRow) -> Treatment {
    let lead = row.cell(0);
    let number = coerce_integer(lead);
    let mut attributes = BTreeMap::new();
    for (idx, key) in columns {
        let value = row.cell(*idx);
        if value.is_empty() || (*idx == 0 && number.is_some()) {
            continue;
        }
        attributes.insert(key.clone(), value.to_string());
    }
    Treatment { number, attributes }
}

fn label_value(row: &GridRow) -> Option<(&'static str, String)> {
    let mut cells = non_empty_cells(row);
    let (_, first) = cells.next()?;
    let label = label_text(first);
    let (_, key, is_date) = LABELS.iter().find(|(l, _, _)| *l == label)?;
    let (_, raw) = cells.next()?;
    let value = if *is_date {
        coerce_date(raw)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| raw.to_string())
    } else {
        raw.to_string()
    };
    Some((*key, value))
}

/// Extract labelled metadata and the treatment table from a summary grid.
/// The first occurrence of a label wins.
pub fn extract_summary(grid: &Grid) -> TrialSummary {
    let mut summary = TrialSummary::default();
    let mut treatment_columns: Option<Vec<(usize, String)>> = None;

    for row in grid {
        // A blank leading cell ends the treatment table.
        if treatment_columns.is_some() && row.cell(0).is_empty() {
            treatment_columns = None;
        }
        if let Some(columns) = &treatment_columns {
            summary.treatments.push(treatment_row(columns, row));
            continue;
        }

        if let Some(columns) = treatment_header(row) {
            treatment_columns = Some(columns);
            continue;
        }

        if let Some((key, value)) = label_value(row) {
            summary.metadata.entry(key.to_string()).or_insert(value);
        }
    }

    tracing::debug!(
        fields = summary.metadata.len(),
        treatments = summary.treatments.len(),
        "extracted trial summary"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::delimited::read_grid;

    const SHEET: &str = "\
Trial Summary,,,
Trial ID:,tr-2024-07,,
Crop:, Corn ,,
Planting Date:,05/04/2024,,
Cooperator,,Smith Farms,
Weather,sunny,,
,,,
Trt No,Product,Rate,Timing
1,Untreated check,,
2,BioBoost,2 qt/ac,V6
3,BioBoost,4 qt/ac,V6
,,,
Notes:,Irrigated,,
";

    #[test]
    fn labels_and_treatments_are_extracted() {
        let grid = read_grid(SHEET).unwrap();
        let summary = extract_summary(&grid);

        assert_eq!(summary.metadata.get("trial_id").map(String::as_str), Some("tr-2024-07"));
        assert_eq!(summary.trial_id().as_deref(), Some("TR-2024-07"));
        assert_eq!(summary.metadata.get("crop").map(String::as_str), Some("Corn"));
        assert_eq!(
            summary.metadata.get("planting_date").map(String::as_str),
            Some("2024-04-05")
        );
        assert_eq!(
            summary.metadata.get("cooperator").map(String::as_str),
            Some("Smith Farms")
        );
        assert_eq!(summary.metadata.get("notes").map(String::as_str), Some("Irrigated"));
        assert!(!summary.metadata.contains_key("weather"));

        assert_eq!(summary.treatments.len(), 3);
        assert_eq!(summary.treatments[0].number, Some(1));
        assert_eq!(
            summary.treatments[0].attributes.get("product").map(String::as_str),
            Some("Untreated check")
        );
        assert!(!summary.treatments[0].attributes.contains_key("rate"));
        assert_eq!(
            summary.treatments[2].attributes.get("rate").map(String::as_str),
            Some("4 qt/ac")
        );

        assert_eq!(summary.record_count(), 5 + 3);
    }

    #[test]
    fn treatment_lead_alone_is_not_a_table_header() {
        let grid = read_grid("Treatment,Fungicide A\nTrial ID,T-1\n").unwrap();
        let summary = extract_summary(&grid);
        assert!(summary.treatments.is_empty());
        assert_eq!(summary.trial_id().as_deref(), Some("T-1"));
    }

    #[test]
    fn non_numeric_treatment_labels_are_kept_as_attributes() {
        let grid = read_grid("TRT,Description\nA,Grower standard\nB,Grower + product\n").unwrap();
        let summary = extract_summary(&grid);
        assert_eq!(summary.treatments.len(), 2);
        assert_eq!(summary.treatments[0].number, None);
        assert_eq!(
            summary.treatments[0].attributes.get("trt").map(String::as_str),
            Some("A")
        );
    }

    #[test]
    fn unrecognized_sheet_is_empty() {
        let grid = read_grid("Weather,Sunny\nWind,Calm\n").unwrap();
        assert!(extract_summary(&grid).is_empty());
    }
}
