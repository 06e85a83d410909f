//! Geospatial layer normalization.
//!
//! Turns an uploaded GIS file into one or more sanitized GeoJSON feature
//! collections. The transform is pure: nothing is stored.
//!
//! | Extension          | Reader                               |
//! |--------------------|--------------------------------------|
//! | `.geojson` `.json` | [`geojson::parse_geojson`]           |
//! | `.kml`             | [`kml::parse_kml`]                   |
//! | `.kmz`             | [`kml::parse_kmz`]                   |
//! | `.zip` `.shz`      | [`shapefile::read_archive`]          |
//! | `.shp`             | [`shapefile::read_shapefile`] (no attributes) |

pub mod archive;
pub mod geojson;
pub mod geometry;
pub mod kml;
pub mod sanitize;
pub mod shapefile;

use tracing::debug;

use crate::classify;
use crate::error::GisError;
use geometry::FeatureCollection;
use sanitize::SanitizeStats;
use shapefile::ShapefileBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GisFormat {
    GeoJson,
    Kml,
    Kmz,
    ShapefileArchive,
    Shapefile,
}

impl GisFormat {
    /// Detect the format from the file extension alone.
    pub fn detect(filename: &str) -> Result<Self, GisError> {
        match classify::extension(filename).as_deref() {
            Some("geojson" | "json") => Ok(GisFormat::GeoJson),
            Some("kml") => Ok(GisFormat::Kml),
            Some("kmz") => Ok(GisFormat::Kmz),
            Some("zip" | "shz") => Ok(GisFormat::ShapefileArchive),
            Some("shp") => Ok(GisFormat::Shapefile),
            _ => Err(GisError::UnsupportedExtension {
                filename: filename.to_string(),
            }),
        }
    }
}

/// One sanitized output layer.
#[derive(Debug, Clone)]
pub struct GisLayer {
    pub name: String,
    pub collection: FeatureCollection,
    pub stats: SanitizeStats,
}

/// Upload filename without directories or extension.
pub fn file_stem(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

/// Parse, then sanitize every layer of a GIS upload.
pub fn normalize_gis_file(filename: &str, bytes: &[u8]) -> Result<Vec<GisLayer>, GisError> {
    let format = GisFormat::detect(filename)?;
    let stem = file_stem(filename);

    let raw: Vec<(String, FeatureCollection)> = match format {
        GisFormat::GeoJson => vec![(stem, geojson::parse_geojson(bytes)?)],
        GisFormat::Kml => vec![(stem, kml::parse_kml(bytes)?)],
        GisFormat::Kmz => vec![(stem, kml::parse_kmz(bytes)?)],
        GisFormat::Shapefile => vec![(stem, shapefile::read_shapefile(filename, bytes, None, None)?)],
        GisFormat::ShapefileArchive => match shapefile::read_archive(bytes)? {
            ShapefileBundle::One(collection) => vec![(stem, collection)],
            ShapefileBundle::Many(layers) => layers,
        },
    };

    Ok(raw
        .into_iter()
        .map(|(name, collection)| {
            let (collection, stats) = sanitize::sanitize(collection);
            debug!(
                layer = %name,
                before = stats.features_before,
                after = stats.features_after,
                "sanitized GIS layer"
            );
            GisLayer {
                name,
                collection,
                stats,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::shapefile::fixtures::*;
    use super::*;
    use std::io::Write;

    #[test]
    fn format_by_extension() {
        assert_eq!(GisFormat::detect("a.GeoJSON").unwrap(), GisFormat::GeoJson);
        assert_eq!(GisFormat::detect("a.json").unwrap(), GisFormat::GeoJson);
        assert_eq!(GisFormat::detect("a.shz").unwrap(), GisFormat::ShapefileArchive);
        assert!(matches!(
            GisFormat::detect("plots.gpx"),
            Err(GisError::UnsupportedExtension { .. })
        ));
        assert!(GisFormat::detect("noext").is_err());
    }

    #[test]
    fn stems() {
        assert_eq!(file_stem("uploads/Field Boundaries.zip"), "Field Boundaries");
        assert_eq!(file_stem("C:\\x\\plots.kml"), "plots");
        assert_eq!(file_stem("plots"), "plots");
    }

    #[test]
    fn geojson_layer_is_sanitized() {
        let doc = br#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{}},
            {"type":"Feature","geometry":null,"properties":{}}
        ]}"#;
        let layers = normalize_gis_file("boundary.geojson", doc).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "boundary");
        assert_eq!(layers[0].collection.len(), 1);
        assert_eq!(layers[0].stats.features_before, 2);
        assert_eq!(layers[0].stats.features_after, 1);
    }

    #[test]
    fn bare_shp_has_no_attributes() {
        let shp = shp_file(&[point_record(1.0, 2.0), null_record()]);
        let layers = normalize_gis_file("probes.shp", &shp).unwrap();
        assert_eq!(layers[0].name, "probes");
        assert_eq!(layers[0].stats.dropped(), 1);
        assert!(layers[0].collection.features[0].properties.is_empty());
    }

    #[test]
    fn single_layer_archive_takes_upload_name() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("export/layer0.shp", opts).unwrap();
            zip.write_all(&shp_file(&[polygon_record(&[square(0.0, 0.0, 1.0)])]))
                .unwrap();
            zip.finish().unwrap();
        }
        let layers = normalize_gis_file("North Farm.zip", &buf).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "North Farm");
        assert_eq!(layers[0].collection.len(), 1);
    }
}
