//! Office Open XML workbook (`.xlsx`, `.xlsm`) → raw grid.
//!
//! Reads the archive directly with `zip` and `quick-xml`. Cell values are
//! kept as their stored text: numbers (including date cells, which are
//! serial day counts) are not reformatted, so date coercion sees exactly
//! what the workbook holds.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::{Grid, GridRow};
use crate::error::ParseError;
use crate::mapping::header_key;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
/// Maximum cells to read per sheet.
const MAX_CELLS_PER_SHEET: usize = 2_000_000;
/// OLE compound document signature used by legacy `.xls` files.
const OLE_SIGNATURE: [u8; 4] = [0xD0, 0xCF, 0x11, 0xE0];

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn workbook_err(e: impl std::fmt::Display) -> ParseError {
    ParseError::Workbook(e.to_string())
}

/// A worksheet as listed in the workbook.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetEntry {
    pub name: String,
    pub path: String,
}

/// Read one worksheet of the workbook into a grid.
///
/// The first sheet whose name contains one of `sheet_hints` (compared by
/// [`header_key`]) and has content wins; otherwise the first non-empty sheet.
pub fn read_workbook(bytes: &[u8], sheet_hints: &[&str]) -> Result<Grid, ParseError> {
    if bytes.starts_with(&OLE_SIGNATURE) {
        return Err(ParseError::LegacyWorkbook);
    }
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(workbook_err)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive)?;
    if sheets.is_empty() {
        return Err(ParseError::Workbook("workbook has no worksheets".to_string()));
    }

    for hint in sheet_hints {
        let hint_key = header_key(hint);
        if hint_key.is_empty() {
            continue;
        }
        for sheet in sheets.iter().filter(|s| header_key(&s.name).contains(&hint_key)) {
            let grid = read_sheet(&mut archive, sheet, &shared_strings)?;
            if grid.iter().any(|r| !r.is_blank()) {
                debug!(sheet = %sheet.name, hint, "selected worksheet by name");
                return Ok(grid);
            }
        }
    }

    for sheet in &sheets {
        let grid = read_sheet(&mut archive, sheet, &shared_strings)?;
        if grid.iter().any(|r| !r.is_blank()) {
            debug!(sheet = %sheet.name, "selected first non-empty worksheet");
            return Ok(grid);
        }
    }
    Ok(Vec::new())
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ParseError> {
    let entry = archive.by_name(name).map_err(workbook_err)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(workbook_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParseError::Workbook(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn has_entry(archive: &Archive<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>, ParseError> {
    for attr in e.attributes() {
        let attr = attr.map_err(workbook_err)?;
        if attr.key.local_name().as_ref() == local {
            let value = attr.unescape_value().map_err(workbook_err)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Shared string table; rich-text runs are concatenated, phonetic runs skipped.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ParseError> {
    if !has_entry(archive, "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(workbook_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"rPh" => in_phonetic = true,
                b"t" if in_si && !in_phonetic => in_t = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(te) if in_t => {
                current.push_str(&te.unescape().map_err(workbook_err)?);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"rPh" => in_phonetic = false,
                b"t" => in_t = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Worksheets in workbook order, resolved through the workbook relationships.
/// Falls back to `xl/worksheets/sheetN.xml` naming when the workbook part
/// cannot be resolved.
pub fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<SheetEntry>, ParseError> {
    let rels = if has_entry(archive, "xl/_rels/workbook.xml.rels") {
        read_relationships(&read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels")?)?
    } else {
        HashMap::new()
    };

    let mut sheets = Vec::new();
    if has_entry(archive, "xl/workbook.xml") {
        let xml = read_zip_entry_bounded(archive, "xl/workbook.xml")?;
        let mut reader = Reader::from_reader(xml.as_slice());
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf).map_err(workbook_err)? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                    let name = attr_value(&e, b"name")?.unwrap_or_default();
                    let target = attr_value(&e, b"id")?.and_then(|id| rels.get(&id).cloned());
                    if let Some(target) = target {
                        let path = match target.strip_prefix('/') {
                            Some(absolute) => absolute.to_string(),
                            None => format!("xl/{}", target),
                        };
                        if has_entry(archive, &path) {
                            sheets.push(SheetEntry { name, path });
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
    }

    if sheets.is_empty() {
        let mut paths: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
            .map(|s| s.to_string())
            .collect();
        paths.sort_by_key(|name| {
            name.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        });
        sheets = paths
            .into_iter()
            .map(|path| SheetEntry {
                name: path
                    .trim_start_matches("xl/worksheets/")
                    .trim_end_matches(".xml")
                    .to_string(),
                path,
            })
            .collect();
    }
    Ok(sheets)
}

fn read_relationships(xml: &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let mut rels = HashMap::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(workbook_err)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr_value(&e, b"Id")?, attr_value(&e, b"Target")?) {
                    rels.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Widest worksheet Excel allows (column `XFD`).
const MAX_COLUMNS: usize = 16_384;

/// Zero-based column index from an `A1`-style reference. `Ok(None)` when
/// the reference has no column letters; an error when the column lies past
/// `XFD`.
pub fn column_index(cell_ref: &str) -> Result<Option<usize>, ParseError> {
    let mut idx = 0usize;
    let mut seen = false;
    for ch in cell_ref.chars() {
        if !ch.is_ascii_alphabetic() {
            break;
        }
        let digit = ch.to_ascii_uppercase() as usize - 'A' as usize + 1;
        idx = idx
            .checked_mul(26)
            .and_then(|v| v.checked_add(digit))
            .filter(|v| *v <= MAX_COLUMNS)
            .ok_or_else(|| {
                ParseError::Workbook(format!("cell reference '{}' is out of range", cell_ref))
            })?;
        seen = true;
    }
    Ok(if seen { Some(idx - 1) } else { None })
}

#[derive(Default)]
struct CellState {
    column: usize,
    kind: Option<String>,
    value: String,
    in_value: bool,
    in_inline: bool,
}

impl CellState {
    fn resolve(&self, shared_strings: &[String]) -> String {
        match self.kind.as_deref() {
            Some("s") => self
                .value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| shared_strings.get(i).cloned())
                .unwrap_or_default(),
            Some("b") => match self.value.trim() {
                "1" => "TRUE".to_string(),
                "0" => "FALSE".to_string(),
                other => other.to_string(),
            },
            _ => self.value.clone(),
        }
    }
}

fn read_sheet(
    archive: &mut Archive<'_>,
    sheet: &SheetEntry,
    shared_strings: &[String],
) -> Result<Grid, ParseError> {
    let xml = read_zip_entry_bounded(archive, &sheet.path)?;
    parse_sheet_xml(&xml, shared_strings)
}

/// Parse worksheet XML into rows numbered by their `r` attribute.
pub fn parse_sheet_xml(xml: &[u8], shared_strings: &[String]) -> Result<Grid, ParseError> {
    let mut grid: Grid = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut row: Option<GridRow> = None;
    let mut cell: Option<CellState> = None;
    let mut cell_count = 0usize;

    loop {
        match reader.read_event_into(&mut buf).map_err(workbook_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    let number = attr_value(&e, b"r")?
                        .and_then(|r| r.parse::<usize>().ok())
                        .unwrap_or_else(|| grid.last().map(|r| r.number + 1).unwrap_or(1));
                    row = Some(GridRow {
                        number,
                        cells: Vec::new(),
                    });
                }
                b"c" => {
                    let next_column = row.as_ref().map(|r| r.cells.len()).unwrap_or(0);
                    let column = match attr_value(&e, b"r")? {
                        Some(r) => column_index(&r)?.unwrap_or(next_column),
                        None => next_column,
                    };
                    cell = Some(CellState {
                        column,
                        kind: attr_value(&e, b"t")?,
                        ..CellState::default()
                    });
                }
                b"v" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_value = true;
                    }
                }
                b"is" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_inline = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                let number = attr_value(&e, b"r")?
                    .and_then(|r| r.parse::<usize>().ok())
                    .unwrap_or_else(|| grid.last().map(|r| r.number + 1).unwrap_or(1));
                grid.push(GridRow {
                    number,
                    cells: Vec::new(),
                });
            }
            Event::Text(te) => {
                if let Some(c) = cell.as_mut() {
                    if c.in_value || c.in_inline {
                        c.value.push_str(&te.unescape().map_err(workbook_err)?);
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_value = false;
                    }
                }
                b"is" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_inline = false;
                    }
                }
                b"c" => {
                    if let (Some(c), Some(r)) = (cell.take(), row.as_mut()) {
                        cell_count += 1;
                        if cell_count > MAX_CELLS_PER_SHEET {
                            return Err(ParseError::Workbook(format!(
                                "worksheet exceeds {} cells",
                                MAX_CELLS_PER_SHEET
                            )));
                        }
                        let text = c.resolve(shared_strings);
                        if r.cells.len() <= c.column {
                            r.cells.resize(c.column + 1, String::new());
                        }
                        r.cells[c.column] = text;
                    }
                }
                b"row" => {
                    if let Some(r) = row.take() {
                        grid.push(r);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(grid)
}
