//! GeoJSON input.

use serde_json::Value;

use super::geometry::{Feature, FeatureCollection, Geometry};
use crate::error::GisError;

/// Read a FeatureCollection, a single Feature, or a bare geometry (wrapped
/// into one feature). Any other root is an error.
pub fn parse_geojson(bytes: &[u8]) -> Result<FeatureCollection, GisError> {
    let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let root: Value = serde_json::from_slice(text)?;
    let kind = root.get("type").and_then(Value::as_str).unwrap_or("");

    match kind {
        "FeatureCollection" => {
            let features = root
                .get("features")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(Feature::from_json).collect())
                .unwrap_or_default();
            Ok(FeatureCollection::new(features))
        }
        "Feature" => Ok(FeatureCollection::new(vec![Feature::from_json(&root)])),
        k if Geometry::is_geometry_type(k) => Ok(FeatureCollection::new(vec![Feature::new(
            Geometry::from_json(&root),
        )])),
        "" => Err(GisError::UnsupportedRoot("<missing type>".to_string())),
        other => Err(GisError::UnsupportedRoot(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_collection() {
        let doc = br#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[1,2]},"properties":{"a":1}},
            {"type":"Feature","geometry":null,"properties":{}}
        ]}"#;
        let fc = parse_geojson(doc).unwrap();
        assert_eq!(fc.len(), 2);
        assert!(fc.features[0].geometry.is_some());
        assert!(fc.features[1].geometry.is_none());
    }

    #[test]
    fn bare_geometry_is_wrapped() {
        let fc = parse_geojson(br#"{"type":"LineString","coordinates":[[0,0],[1,1]]}"#).unwrap();
        assert_eq!(fc.len(), 1);
        assert_eq!(
            fc.features[0].geometry.as_ref().map(Geometry::type_name),
            Some("LineString")
        );
    }

    #[test]
    fn unsupported_roots_fail() {
        assert!(matches!(
            parse_geojson(br#"{"type":"Topology"}"#),
            Err(GisError::UnsupportedRoot(ref t)) if t == "Topology"
        ));
        assert!(matches!(parse_geojson(b"[1,2]"), Err(GisError::UnsupportedRoot(_))));
        assert!(matches!(parse_geojson(b"{not json"), Err(GisError::Json(_))));
    }
}
