//! Delimited text (CSV, TSV, semicolon- or pipe-separated) → raw grid.

use csv::ReaderBuilder;

use super::{Grid, GridRow};
use crate::error::ParseError;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Pick the delimiter that occurs most often on the first non-empty line,
/// outside quotes. Comma wins ties and empty input.
pub fn sniff_delimiter(text: &str) -> u8 {
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        return b',';
    };
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    for byte in line.bytes() {
        if byte == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(pos) = CANDIDATE_DELIMITERS.iter().position(|d| *d == byte) {
            counts[pos] += 1;
        }
    }
    let mut best = 0;
    for (i, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = i;
        }
    }
    CANDIDATE_DELIMITERS[best]
}

/// Read delimited text into rows numbered by source line.
pub fn read_grid(text: &str) -> Result<Grid, ParseError> {
    let text = text.trim_start_matches('\u{feff}');
    let delimiter = sniff_delimiter(text);

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    // A record's position is taken before the reader skips blank lines, so
    // step past them to find the line the record really starts on.
    let bytes = text.as_bytes();
    let mut line = 1usize;
    let mut scanned = 0usize;
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut start = record
            .position()
            .map(|p| p.byte() as usize)
            .unwrap_or(scanned)
            .clamp(scanned, bytes.len());
        while matches!(bytes.get(start), Some(b'\r' | b'\n')) {
            start += 1;
        }
        line += bytes[scanned..start].iter().filter(|b| **b == b'\n').count();
        scanned = start;
        grid.push(GridRow {
            number: line,
            cells: record.iter().map(|c| c.to_string()).collect(),
        });
    }
    Ok(grid)
}
