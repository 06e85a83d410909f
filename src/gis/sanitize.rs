//! Geometry validity checks and feature filtering.
//!
//! Downstream map renderers reject a whole layer over one bad feature, so
//! every layer is filtered here before it leaves the crate.

use super::geometry::{FeatureCollection, Geometry, Position};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SanitizeStats {
    pub features_before: usize,
    pub features_after: usize,
}

impl SanitizeStats {
    pub fn dropped(&self) -> usize {
        self.features_before - self.features_after
    }
}

fn valid_position(p: &Position) -> bool {
    p.len() >= 2 && p.iter().all(|c| c.is_finite())
}

fn valid_line(line: &[Position]) -> bool {
    line.len() >= 2 && line.iter().all(valid_position)
}

fn valid_ring(ring: &[Position]) -> bool {
    ring.len() >= 4 && ring.iter().all(valid_position)
}

fn valid_polygon(rings: &[Vec<Position>]) -> bool {
    !rings.is_empty() && rings.iter().all(|r| valid_ring(r))
}

/// Structural validity: enough finite positions for the geometry type.
/// Collections must be non-empty with every member valid.
pub fn is_valid(geometry: &Geometry) -> bool {
    match geometry {
        Geometry::Point { coordinates } => valid_position(coordinates),
        Geometry::MultiPoint { coordinates } => {
            !coordinates.is_empty() && coordinates.iter().all(valid_position)
        }
        Geometry::LineString { coordinates } => valid_line(coordinates),
        Geometry::MultiLineString { coordinates } => {
            !coordinates.is_empty() && coordinates.iter().all(|l| valid_line(l))
        }
        Geometry::Polygon { coordinates } => valid_polygon(coordinates),
        Geometry::MultiPolygon { coordinates } => {
            !coordinates.is_empty() && coordinates.iter().all(|p| valid_polygon(p))
        }
        Geometry::GeometryCollection { geometries } => {
            !geometries.is_empty() && geometries.iter().all(is_valid)
        }
    }
}

/// Drop features with missing or invalid geometry.
pub fn sanitize(collection: FeatureCollection) -> (FeatureCollection, SanitizeStats) {
    let features_before = collection.features.len();
    let features: Vec<_> = collection
        .features
        .into_iter()
        .filter(|f| f.geometry.as_ref().map(is_valid).unwrap_or(false))
        .collect();
    let stats = SanitizeStats {
        features_before,
        features_after: features.len(),
    };
    (FeatureCollection::new(features), stats)
}
