//! ESRI shapefile input: `.shp` geometry, `.dbf` attributes, `.cpg`
//! code page.
//!
//! Positions are kept 2-D; Z and M values are skipped. Polygon parts are
//! grouped by ring orientation: clockwise rings are outer boundaries,
//! counter-clockwise rings are holes of the outer ring that contains them.

use serde_json::{Map, Number, Value};
use tracing::debug;

use super::archive;
use super::geometry::{Feature, FeatureCollection, Geometry, Position};
use crate::error::GisError;

const FILE_CODE: i32 = 9994;
const HEADER_LEN: usize = 100;

/// Layers found in a shapefile upload.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapefileBundle {
    /// Exactly one `.shp` member.
    One(FeatureCollection),
    /// Several `.shp` members, each with its member stem.
    Many(Vec<(String, FeatureCollection)>),
}

impl ShapefileBundle {
    pub fn layer_count(&self) -> usize {
        match self {
            ShapefileBundle::One(_) => 1,
            ShapefileBundle::Many(layers) => layers.len(),
        }
    }
}

/// Text encoding of `.dbf` character fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbfEncoding {
    /// UTF-8, falling back to Latin-1 for fields that are not valid UTF-8.
    Utf8,
    Latin1,
}

impl DbfEncoding {
    /// Interpret a `.cpg` file's contents.
    pub fn from_cpg(cpg: &[u8]) -> Self {
        let label = String::from_utf8_lossy(cpg).trim().to_ascii_lowercase();
        if label.contains("utf") || label == "65001" {
            DbfEncoding::Utf8
        } else {
            DbfEncoding::Latin1
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            DbfEncoding::Utf8 => match std::str::from_utf8(bytes) {
                Ok(s) => s.to_string(),
                Err(_) => latin1(bytes),
            },
            DbfEncoding::Latin1 => latin1(bytes),
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ---------------------------------------------------------------------------
// .shp
// ---------------------------------------------------------------------------

/// Bounds-checked little/big-endian reads over one buffer.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    name: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], name: &'a str) -> Self {
        Self { data, pos: 0, name }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GisError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| GisError::shapefile(self.name, "record truncated"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), GisError> {
        self.take(n).map(|_| ())
    }

    fn i32_le(&mut self) -> Result<i32, GisError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn count(&mut self) -> Result<usize, GisError> {
        let n = self.i32_le()?;
        usize::try_from(n).map_err(|_| GisError::shapefile(self.name, format!("negative count {}", n)))
    }

    fn f64_le(&mut self) -> Result<f64, GisError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn point(&mut self) -> Result<Position, GisError> {
        Ok(vec![self.f64_le()?, self.f64_le()?])
    }

    fn points(&mut self, n: usize) -> Result<Vec<Position>, GisError> {
        // Each point is 16 bytes; refuse counts the buffer cannot hold.
        if n.saturating_mul(16) > self.data.len().saturating_sub(self.pos) {
            return Err(GisError::shapefile(self.name, "point count exceeds record size"));
        }
        (0..n).map(|_| self.point()).collect()
    }
}

fn be_i32(data: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Split points into parts by their starting offsets.
fn split_parts(points: Vec<Position>, starts: &[usize]) -> Vec<Vec<Position>> {
    let mut parts = Vec::with_capacity(starts.len());
    for (i, start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(points.len());
        if *start <= end && end <= points.len() {
            parts.push(points[*start..end].to_vec());
        } else {
            parts.push(Vec::new());
        }
    }
    parts
}

/// Shoelace sum; negative for clockwise rings (y axis up).
fn signed_area(ring: &[Position]) -> f64 {
    let mut sum = 0.0;
    for pair in ring.windows(2) {
        sum += pair[0][0] * pair[1][1] - pair[1][0] * pair[0][1];
    }
    sum / 2.0
}

/// Even-odd ray casting.
fn ring_contains(ring: &[Position], p: &Position) -> bool {
    let (x, y) = (p[0], p[1]);
    let mut inside = false;
    for pair in ring.windows(2) {
        let (xi, yi, xj, yj) = (pair[0][0], pair[0][1], pair[1][0], pair[1][1]);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
    }
    inside
}

fn polygon_from_rings(rings: Vec<Vec<Position>>) -> Geometry {
    let mut polygons: Vec<Vec<Vec<Position>>> = Vec::new();
    let mut holes = Vec::new();
    for ring in rings {
        if signed_area(&ring) < 0.0 {
            polygons.push(vec![ring]);
        } else {
            holes.push(ring);
        }
    }

    for hole in holes {
        let owner = hole.first().and_then(|p| {
            polygons
                .iter()
                .position(|poly| p.len() >= 2 && ring_contains(&poly[0], p))
        });
        match owner {
            Some(i) => polygons[i].push(hole),
            // Orphan holes are usually mis-wound outer rings.
            None => polygons.push(vec![hole]),
        }
    }

    if polygons.len() == 1 {
        Geometry::Polygon {
            coordinates: polygons.remove(0),
        }
    } else {
        Geometry::MultiPolygon {
            coordinates: polygons,
        }
    }
}

fn parse_record(name: &str, content: &[u8]) -> Result<Option<Geometry>, GisError> {
    let mut c = Cursor::new(content, name);
    let shape_type = c.i32_le()?;
    let geometry = match shape_type {
        0 => None,
        1 | 11 | 21 => Some(Geometry::Point {
            coordinates: c.point()?,
        }),
        8 | 18 | 28 => {
            c.skip(32)?;
            let n = c.count()?;
            Some(Geometry::MultiPoint {
                coordinates: c.points(n)?,
            })
        }
        3 | 13 | 23 | 5 | 15 | 25 => {
            c.skip(32)?;
            let num_parts = c.count()?;
            let num_points = c.count()?;
            if num_parts.saturating_mul(4) > content.len() {
                return Err(GisError::shapefile(name, "part count exceeds record size"));
            }
            let starts = (0..num_parts)
                .map(|_| c.count())
                .collect::<Result<Vec<_>, _>>()?;
            let parts = split_parts(c.points(num_points)?, &starts);
            let is_polygon = matches!(shape_type, 5 | 15 | 25);
            Some(match (is_polygon, parts.len()) {
                (true, _) => polygon_from_rings(parts),
                (false, 1) => Geometry::LineString {
                    coordinates: parts.into_iter().next().unwrap_or_default(),
                },
                (false, _) => Geometry::MultiLineString { coordinates: parts },
            })
        }
        other => {
            // MultiPatch (31) and unknown types
            debug!(file = name, shape_type = other, "unsupported shape type");
            None
        }
    };
    Ok(geometry)
}

/// Decode every record of a `.shp` file, in file order.
pub fn read_shp(name: &str, data: &[u8]) -> Result<Vec<Option<Geometry>>, GisError> {
    if data.len() < HEADER_LEN {
        return Err(GisError::shapefile(name, "shorter than the 100-byte header"));
    }
    if be_i32(data, 0) != FILE_CODE {
        return Err(GisError::shapefile(name, "not a shapefile (bad file code)"));
    }
    let declared = (be_i32(data, 24).max(0) as usize).saturating_mul(2);
    let end = if declared >= HEADER_LEN {
        declared.min(data.len())
    } else {
        data.len()
    };

    let mut geometries = Vec::new();
    let mut pos = HEADER_LEN;
    while pos + 8 <= end {
        let record_no = be_i32(data, pos);
        let content_len = (be_i32(data, pos + 4).max(0) as usize).saturating_mul(2);
        let start = pos + 8;
        let stop = start.saturating_add(content_len);
        if stop > end {
            return Err(GisError::shapefile(
                name,
                format!("record {} runs past the end of the file", record_no),
            ));
        }
        geometries.push(parse_record(name, &data[start..stop])?);
        pos = stop;
    }
    Ok(geometries)
}

// ---------------------------------------------------------------------------
// .dbf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DbfField {
    name: String,
    kind: u8,
    length: usize,
    decimals: u8,
}

fn dbf_value(field: &DbfField, raw: &[u8], encoding: DbfEncoding) -> Value {
    let text = encoding.decode(raw);
    let trimmed = text.trim_matches(|c: char| c == ' ' || c == '\0');
    match field.kind {
        b'N' | b'F' => {
            if trimmed.is_empty() {
                return Value::Null;
            }
            if field.decimals == 0 {
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Value::Number(i.into());
                }
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        b'L' => match trimmed.chars().next() {
            Some('Y' | 'y' | 'T' | 't') => Value::Bool(true),
            Some('N' | 'n' | 'F' | 'f') => Value::Bool(false),
            _ => Value::Null,
        },
        b'D' => {
            if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
                Value::String(format!(
                    "{}-{}-{}",
                    &trimmed[0..4],
                    &trimmed[4..6],
                    &trimmed[6..8]
                ))
            } else {
                Value::Null
            }
        }
        _ => Value::String(trimmed.to_string()),
    }
}

/// Decode a `.dbf` table. `None` marks a deleted record.
pub fn read_dbf(
    name: &str,
    data: &[u8],
    encoding: DbfEncoding,
) -> Result<Vec<Option<Map<String, Value>>>, GisError> {
    if data.len() < 32 {
        return Err(GisError::shapefile(name, "dbf shorter than its header"));
    }
    let num_records = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
    let record_len = u16::from_le_bytes([data[10], data[11]]) as usize;

    let mut fields = Vec::new();
    let mut pos = 32;
    while pos + 32 <= data.len().min(header_len) && data[pos] != 0x0D {
        let desc = &data[pos..pos + 32];
        let raw_name = desc[..11].split(|b| *b == 0).next().unwrap_or(&[]);
        fields.push(DbfField {
            name: encoding.decode(raw_name).trim().to_string(),
            kind: desc[11].to_ascii_uppercase(),
            length: desc[16] as usize,
            decimals: desc[17],
        });
        pos += 32;
    }
    if record_len == 0 {
        return Ok(Vec::new());
    }

    let mut records = Vec::with_capacity(num_records.min(data.len() / record_len));
    for i in 0..num_records {
        let start = header_len + i * record_len;
        let Some(record) = data.get(start..start + record_len) else {
            break;
        };
        if record[0] == b'*' {
            records.push(None);
            continue;
        }
        let mut props = Map::new();
        let mut offset = 1;
        for field in &fields {
            let raw = record.get(offset..offset + field.length).unwrap_or(&[]);
            props.insert(field.name.clone(), dbf_value(field, raw, encoding));
            offset += field.length;
        }
        records.push(Some(props));
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Pair geometry records with attribute records. Deleted attribute
/// records drop their feature; missing ones leave properties empty.
pub fn read_shapefile(
    name: &str,
    shp: &[u8],
    dbf: Option<&[u8]>,
    cpg: Option<&[u8]>,
) -> Result<FeatureCollection, GisError> {
    let geometries = read_shp(name, shp)?;
    let encoding = cpg.map(DbfEncoding::from_cpg).unwrap_or(DbfEncoding::Utf8);
    let attributes = match dbf {
        Some(bytes) => read_dbf(name, bytes, encoding)?,
        None => Vec::new(),
    };

    let mut features = Vec::with_capacity(geometries.len());
    for (i, geometry) in geometries.into_iter().enumerate() {
        let properties = match attributes.get(i) {
            Some(None) => continue,
            Some(Some(props)) => props.clone(),
            None => Map::new(),
        };
        features.push(Feature {
            id: None,
            geometry,
            properties,
        });
    }
    Ok(FeatureCollection::new(features))
}

fn stem_and_ext(member: &str) -> Option<(&str, String)> {
    let (stem, ext) = member.rsplit_once('.')?;
    Some((stem, ext.to_ascii_lowercase()))
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `base`, or `base_2`, `base_3`, ... when an earlier layer already took
/// that name. Compared case-insensitively since layers become file names.
fn unique_layer_name(base: &str, taken: &[(String, FeatureCollection)]) -> String {
    let free = |name: &str| !taken.iter().any(|(t, _)| t.eq_ignore_ascii_case(name));
    if free(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|name| free(name))
        .unwrap_or_else(|| base.to_string())
}

/// Read every `.shp` member of a zipped shapefile set, with the `.dbf`
/// and `.cpg` members that share its path stem.
pub fn read_archive(bytes: &[u8]) -> Result<ShapefileBundle, GisError> {
    let mut zip = archive::open(bytes)?;
    let members = archive::member_names(&zip);

    let sibling = |stem: &str, ext: &str| -> Option<String> {
        members
            .iter()
            .find(|m| {
                stem_and_ext(m)
                    .map(|(s, e)| s.eq_ignore_ascii_case(stem) && e == ext)
                    .unwrap_or(false)
            })
            .cloned()
    };

    let mut layers = Vec::new();
    for member in &members {
        let Some((stem, ext)) = stem_and_ext(member) else {
            continue;
        };
        if ext != "shp" {
            continue;
        }
        let shp = archive::read_member(&mut zip, member)?;
        let dbf = match sibling(stem, "dbf") {
            Some(m) => Some(archive::read_member(&mut zip, &m)?),
            None => None,
        };
        let cpg = match sibling(stem, "cpg") {
            Some(m) => Some(archive::read_member(&mut zip, &m)?),
            None => None,
        };
        let collection = read_shapefile(member, &shp, dbf.as_deref(), cpg.as_deref())?;
        debug!(member = %member, features = collection.len(), "read shapefile layer");
        let name = unique_layer_name(base_name(stem), &layers);
        layers.push((name, collection));
    }

    match layers.len() {
        0 => Err(GisError::MissingMember(".shp")),
        1 => Ok(ShapefileBundle::One(layers.remove(0).1)),
        _ => Ok(ShapefileBundle::Many(layers)),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal shapefile writers for tests.

    fn be(v: i32) -> [u8; 4] {
        v.to_be_bytes()
    }

    pub fn point_record(x: f64, y: f64) -> Vec<u8> {
        let mut r = 1i32.to_le_bytes().to_vec();
        r.extend(x.to_le_bytes());
        r.extend(y.to_le_bytes());
        r
    }

    pub fn null_record() -> Vec<u8> {
        0i32.to_le_bytes().to_vec()
    }

    fn parts_record(shape_type: i32, parts: &[Vec<(f64, f64)>]) -> Vec<u8> {
        let mut r = shape_type.to_le_bytes().to_vec();
        r.extend([0u8; 32]);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        r.extend((parts.len() as i32).to_le_bytes());
        r.extend((total as i32).to_le_bytes());
        let mut start = 0i32;
        for p in parts {
            r.extend(start.to_le_bytes());
            start += p.len() as i32;
        }
        for p in parts {
            for (x, y) in p {
                r.extend(x.to_le_bytes());
                r.extend(y.to_le_bytes());
            }
        }
        r
    }

    pub fn polygon_record(rings: &[Vec<(f64, f64)>]) -> Vec<u8> {
        parts_record(5, rings)
    }

    pub fn polyline_record(parts: &[Vec<(f64, f64)>]) -> Vec<u8> {
        parts_record(3, parts)
    }

    /// Clockwise unit square at `(x, y)`.
    pub fn square(x: f64, y: f64, size: f64) -> Vec<(f64, f64)> {
        vec![
            (x, y),
            (x, y + size),
            (x + size, y + size),
            (x + size, y),
            (x, y),
        ]
    }

    pub fn shp_file(records: &[Vec<u8>]) -> Vec<u8> {
        let body_len: usize = records.iter().map(|r| r.len() + 8).sum();
        let mut out = Vec::new();
        out.extend(be(9994));
        out.extend([0u8; 20]);
        out.extend(be(((100 + body_len) / 2) as i32));
        out.extend(1000i32.to_le_bytes());
        let shape_type = records
            .iter()
            .map(|r| i32::from_le_bytes([r[0], r[1], r[2], r[3]]))
            .find(|t| *t != 0)
            .unwrap_or(0);
        out.extend(shape_type.to_le_bytes());
        out.extend([0u8; 64]);
        for (i, r) in records.iter().enumerate() {
            out.extend(be(i as i32 + 1));
            out.extend(be((r.len() / 2) as i32));
            out.extend(r);
        }
        out
    }

    pub fn text_row(values: &[&str]) -> Vec<Vec<u8>> {
        values.iter().map(|v| v.as_bytes().to_vec()).collect()
    }

    /// `fields`: (name, type, length). `records`: (deleted, raw values).
    pub fn dbf_file(fields: &[(&str, u8, u8)], records: &[(bool, Vec<Vec<u8>>)]) -> Vec<u8> {
        let header_len = 32 + fields.len() * 32 + 1;
        let record_len = 1 + fields.iter().map(|f| f.2 as usize).sum::<usize>();
        let mut out = vec![0x03, 124, 1, 1];
        out.extend((records.len() as u32).to_le_bytes());
        out.extend((header_len as u16).to_le_bytes());
        out.extend((record_len as u16).to_le_bytes());
        out.extend([0u8; 20]);
        for (name, kind, len) in fields {
            let mut desc = [0u8; 32];
            desc[..name.len()].copy_from_slice(name.as_bytes());
            desc[11] = *kind;
            desc[16] = *len;
            out.extend(desc);
        }
        out.push(0x0D);
        for (deleted, values) in records {
            out.push(if *deleted { b'*' } else { b' ' });
            for ((_, _, len), value) in fields.iter().zip(values) {
                let mut cell = value.clone();
                cell.resize(*len as usize, b' ');
                out.extend(cell);
            }
        }
        out.push(0x1A);
        out
    }
}
