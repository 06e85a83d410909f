//! GeoJSON-shaped geometry and feature types.
//!
//! Geometries serialize exactly as RFC 7946 GeoJSON (`{"type": ..,
//! "coordinates": ..}`). Parsing from arbitrary JSON is lenient: any shape
//! that does not fit becomes `None` and the sanitizer drops the feature.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// `[x, y]` or `[x, y, z]`. Length and finiteness are checked by the
/// sanitizer, not here.
pub type Position = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

fn position(v: &Value) -> Option<Position> {
    v.as_array()?.iter().map(Value::as_f64).collect()
}

fn positions(v: &Value) -> Option<Vec<Position>> {
    v.as_array()?.iter().map(position).collect()
}

fn position_rings(v: &Value) -> Option<Vec<Vec<Position>>> {
    v.as_array()?.iter().map(positions).collect()
}

fn polygons(v: &Value) -> Option<Vec<Vec<Vec<Position>>>> {
    v.as_array()?.iter().map(position_rings).collect()
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }

    /// Read a GeoJSON geometry object. Unknown types and coordinate arrays
    /// of the wrong nesting depth yield `None`.
    pub fn from_json(v: &Value) -> Option<Geometry> {
        let kind = v.get("type")?.as_str()?;
        if kind == "GeometryCollection" {
            let geometries = v
                .get("geometries")?
                .as_array()?
                .iter()
                .map(Geometry::from_json)
                .collect::<Option<Vec<_>>>()?;
            return Some(Geometry::GeometryCollection { geometries });
        }

        let c = v.get("coordinates")?;
        let geometry = match kind {
            "Point" => Geometry::Point {
                coordinates: position(c)?,
            },
            "MultiPoint" => Geometry::MultiPoint {
                coordinates: positions(c)?,
            },
            "LineString" => Geometry::LineString {
                coordinates: positions(c)?,
            },
            "MultiLineString" => Geometry::MultiLineString {
                coordinates: position_rings(c)?,
            },
            "Polygon" => Geometry::Polygon {
                coordinates: position_rings(c)?,
            },
            "MultiPolygon" => Geometry::MultiPolygon {
                coordinates: polygons(c)?,
            },
            _ => return None,
        };
        Some(geometry)
    }

    /// Whether `kind` names a GeoJSON geometry type.
    pub fn is_geometry_type(kind: &str) -> bool {
        matches!(
            kind,
            "Point"
                | "MultiPoint"
                | "LineString"
                | "MultiLineString"
                | "Polygon"
                | "MultiPolygon"
                | "GeometryCollection"
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    pub id: Option<Value>,
    /// `None` for null, unrecognized or malformed geometry.
    pub geometry: Option<Geometry>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Option<Geometry>) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    pub fn from_json(v: &Value) -> Feature {
        Feature {
            id: v.get("id").filter(|id| !id.is_null()).cloned(),
            geometry: v.get("geometry").and_then(Geometry::from_json),
            properties: v
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "type": "Feature",
            "geometry": self.geometry,
            "properties": self.properties,
        });
        if let (Some(id), Some(obj)) = (&self.id, out.as_object_mut()) {
            obj.insert("id".to_string(), id.clone());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn to_geojson(&self) -> Value {
        json!({
            "type": "FeatureCollection",
            "features": self.features.iter().map(Feature::to_json).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_serializes_as_geojson() {
        let g = Geometry::Point {
            coordinates: vec![-93.5, 42.0],
        };
        assert_eq!(
            serde_json::to_value(&g).unwrap(),
            json!({"type": "Point", "coordinates": [-93.5, 42.0]})
        );
    }

    #[test]
    fn wrong_nesting_is_none() {
        let v = json!({"type": "Polygon", "coordinates": [[1.0, 2.0]]});
        assert_eq!(Geometry::from_json(&v), None);
        let v = json!({"type": "Circle", "coordinates": [1.0, 2.0]});
        assert_eq!(Geometry::from_json(&v), None);
        let v = json!({"type": "GeometryCollection", "geometries": [
            {"type": "Point", "coordinates": [0.0, 0.0]},
            {"type": "Blob"}
        ]});
        assert_eq!(Geometry::from_json(&v), None);
    }

    #[test]
    fn feature_round_trips_properties_and_id() {
        let v = json!({
            "type": "Feature",
            "id": 7,
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {"plot": "101"}
        });
        let f = Feature::from_json(&v);
        assert_eq!(f.id, Some(json!(7)));
        assert_eq!(f.properties["plot"], json!("101"));
        assert_eq!(f.to_json(), v);
    }

    #[test]
    fn null_geometry_serializes_as_null() {
        let f = Feature::new(None);
        assert_eq!(f.to_json()["geometry"], Value::Null);
    }
}
