//! Raw content parsing: delimited text or workbook bytes → header-keyed rows.
//!
//! Headers are trimmed and whitespace-collapsed here but not aliased; that
//! happens in [`normalize`](crate::normalize). Fully-empty rows are skipped
//! but keep their place in the row numbering, so error messages point at
//! the right source line.

pub mod delimited;
pub mod xlsx;

use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::models::{ParsedRow, ParsedTable, UploadContent};

/// One source row with its 1-based line (text) or row (workbook) number.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub number: usize,
    pub cells: Vec<String>,
}

impl GridRow {
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }

    /// Cell at `idx`, trimmed; empty when absent.
    pub fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map(|c| c.trim()).unwrap_or("")
    }
}

/// Untyped cell grid as read from the source.
pub type Grid = Vec<GridRow>;

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls"];

/// Wrap raw upload bytes: workbooks (by extension or zip signature) stay
/// binary, everything else must be UTF-8 text.
pub fn decode_upload(filename: &str, bytes: Vec<u8>) -> Result<UploadContent, ParseError> {
    let is_workbook = crate::classify::extension(filename)
        .map(|ext| WORKBOOK_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
        || bytes.starts_with(b"PK\x03\x04");
    if is_workbook {
        return Ok(UploadContent::Binary(bytes));
    }
    match String::from_utf8(bytes) {
        Ok(text) => Ok(UploadContent::Text(text)),
        Err(e) => Err(ParseError::Encoding(e.utf8_error())),
    }
}

/// Read the upload into a raw grid. For workbooks, `sheet_hints` pick the
/// worksheet; see [`xlsx::read_workbook`].
pub fn parse_grid(content: &UploadContent, sheet_hints: &[&str]) -> Result<Grid, ParseError> {
    match content {
        UploadContent::Text(text) => delimited::read_grid(text),
        UploadContent::Binary(bytes) => xlsx::read_workbook(bytes, sheet_hints),
    }
}

/// Read the upload into header-keyed rows.
pub fn parse_table(content: &UploadContent, sheet_hints: &[&str]) -> Result<ParsedTable, ParseError> {
    let grid = parse_grid(content, sheet_hints)?;
    grid_to_table(&grid)
}

/// Trim and collapse internal whitespace runs to single spaces.
pub fn clean_header(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Treat the first non-blank row as the header row and key every later
/// non-blank row by it.
pub fn grid_to_table(grid: &[GridRow]) -> Result<ParsedTable, ParseError> {
    let header_pos = grid
        .iter()
        .position(|r| !r.is_blank())
        .ok_or(ParseError::NoHeader)?;
    let header_row = &grid[header_pos];

    // (column index, cleaned header); blank and repeated headers are dropped.
    let mut columns: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in header_row.cells.iter().enumerate() {
        let header = clean_header(raw);
        if header.is_empty() || columns.iter().any(|(_, h)| *h == header) {
            continue;
        }
        columns.push((idx, header));
    }

    let mut rows = Vec::new();
    for row in &grid[header_pos + 1..] {
        if row.is_blank() {
            continue;
        }
        let mut values = BTreeMap::new();
        for (idx, header) in &columns {
            if let Some(cell) = row.cells.get(*idx) {
                values.insert(header.clone(), cell.trim().to_string());
            }
        }
        rows.push(ParsedRow {
            index: row.number.saturating_sub(header_row.number),
            values,
        });
    }

    Ok(ParsedTable {
        headers: columns.into_iter().map(|(_, h)| h).collect(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(number: usize, cells: &[&str]) -> GridRow {
        GridRow {
            number,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn leading_blank_rows_are_skipped_before_the_header() {
        let grid = vec![
            row(1, &["", ""]),
            row(2, &["  Sample   No ", "Date", ""]),
            row(3, &["S1", "2024-01-05"]),
        ];
        let table = grid_to_table(&grid).unwrap();
        assert_eq!(table.headers, vec!["Sample No", "Date"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].index, 1);
        assert_eq!(table.rows[0].get("Sample No"), Some("S1"));
    }

    #[test]
    fn blank_rows_keep_their_row_number() {
        let grid = vec![
            row(1, &["Plot"]),
            row(2, &["101"]),
            row(3, &["", " "]),
            row(4, &["102"]),
        ];
        let table = grid_to_table(&grid).unwrap();
        let indexes: Vec<usize> = table.rows.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 3]);
    }

    #[test]
    fn text_and_workbook_rows_are_numbered_alike() {
        let csv = parse_table(
            &UploadContent::Text("Plot\n101\n\n102\n".to_string()),
            &[],
        )
        .unwrap();
        let sheet = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="inlineStr"><is><t>Plot</t></is></c></row>
            <row r="2"><c r="A2"><v>101</v></c></row>
            <row r="4"><c r="A4"><v>102</v></c></row>
        </sheetData></worksheet>"#;
        let book = grid_to_table(&xlsx::parse_sheet_xml(sheet, &[]).unwrap()).unwrap();

        let csv_indexes: Vec<usize> = csv.rows.iter().map(|r| r.index).collect();
        let book_indexes: Vec<usize> = book.rows.iter().map(|r| r.index).collect();
        assert_eq!(csv_indexes, vec![1, 3]);
        assert_eq!(csv_indexes, book_indexes);
    }

    #[test]
    fn duplicate_headers_keep_first_column() {
        let grid = vec![row(1, &["Plot", "Plot"]), row(2, &["1", "2"])];
        let table = grid_to_table(&grid).unwrap();
        assert_eq!(table.headers, vec!["Plot"]);
        assert_eq!(table.rows[0].get("Plot"), Some("1"));
    }

    #[test]
    fn uploads_decode_by_extension_and_signature() {
        let text = decode_upload("plots.csv", b"Plot\n1\n".to_vec()).unwrap();
        assert!(matches!(text, UploadContent::Text(ref t) if t == "Plot\n1\n"));
        let book = decode_upload("plots.XLSX", vec![0, 1, 2]).unwrap();
        assert!(matches!(book, UploadContent::Binary(_)));
        let zipped = decode_upload("export.dat", b"PK\x03\x04rest".to_vec()).unwrap();
        assert!(matches!(zipped, UploadContent::Binary(_)));
        assert!(matches!(
            decode_upload("latin.csv", vec![b'a', 0xE9]),
            Err(ParseError::Encoding(_))
        ));
    }

    #[test]
    fn empty_grid_has_no_header() {
        let grid = vec![row(1, &["", ""])];
        assert!(matches!(grid_to_table(&grid), Err(ParseError::NoHeader)));
    }
}
