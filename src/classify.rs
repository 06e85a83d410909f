//! Upload classification: filename (and, when that fails, headers) → [`DataType`].

use crate::mapping::{header_key, MappingRegistry};
use crate::models::DataType;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "tif", "tiff", "bmp",
];

/// Keyword rules, checked in order against the normalized file stem.
/// First match wins.
const RULES: &[(&[&str], DataType)] = &[
    (&["trial summary", "trial info", "trial overview", "protocol summary"], DataType::TrialSummary),
    (&["soil health", "soilhealth", "haney", "slake"], DataType::SoilHealth),
    (&["tissue", "petiole", "plant analysis"], DataType::TissueAnalysis),
    (
        &["soil chem", "soil test", "soil analysis", "soil nutrient", "nutrient"],
        DataType::SoilChemistry,
    ),
    (
        &["sample metadata", "sample meta", "sample info", "sample list", "sample log"],
        DataType::SampleMetadata,
    ),
    (&["plot data", "plot", "yield", "harvest"], DataType::PlotData),
];

fn split_extension(filename: &str) -> (&str, Option<String>) {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext.to_ascii_lowercase())),
        _ => (base, None),
    }
}

/// Lowercased file extension without the dot.
pub fn extension(filename: &str) -> Option<String> {
    split_extension(filename).1
}

/// Classify an upload by its filename. Deterministic and side-effect free.
///
/// ```
/// use field_trial_ingest::classify::classify_filename;
/// use field_trial_ingest::models::DataType;
///
/// assert_eq!(classify_filename("Soil Health Data.csv"), DataType::SoilHealth);
/// assert_eq!(classify_filename("random.xyz"), DataType::Unknown);
/// ```
pub fn classify_filename(filename: &str) -> DataType {
    let (stem, ext) = split_extension(filename);
    if let Some(ext) = ext.as_deref() {
        if IMAGE_EXTENSIONS.contains(&ext) {
            return DataType::Photo;
        }
    }

    // "Soil_Health-2024" and "soil health 2024" read the same.
    let words = header_key(stem).replace('_', " ");
    let squashed = words.replace(' ', "");
    for (keywords, data_type) in RULES {
        let hit = keywords
            .iter()
            .any(|k| words.contains(k) || (k.contains(' ') && squashed.contains(&k.replace(' ', ""))));
        if hit {
            return *data_type;
        }
    }
    DataType::Unknown
}

/// Classify by headers when the filename is not conclusive.
///
/// A mapping qualifies when all its required fields are present; among
/// qualifying mappings the one binding the most headers wins. Ties go to
/// registry order.
pub fn classify_headers(registry: &MappingRegistry, headers: &[String]) -> DataType {
    let mut best: Option<(usize, DataType)> = None;
    for mapping in registry.iter() {
        let binding = mapping.bind(headers);
        let qualifies = mapping.required_fields.iter().all(|f| binding.is_bound(f));
        if !qualifies {
            continue;
        }
        let score = binding.bound_count();
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, mapping.data_type));
        }
    }
    best.map(|(_, dt)| dt).unwrap_or(DataType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_table() {
        let cases = [
            ("Soil Health Data.csv", DataType::SoilHealth),
            ("soil_health_2024.xlsx", DataType::SoilHealth),
            ("SoilHealth.csv", DataType::SoilHealth),
            ("Haney results.csv", DataType::SoilHealth),
            ("Soil Test Results - Spring.csv", DataType::SoilChemistry),
            ("Plot Data.xlsx", DataType::PlotData),
            ("2024 yield.csv", DataType::PlotData),
            ("Sample Metadata.csv", DataType::SampleMetadata),
            ("tissue_v6.csv", DataType::TissueAnalysis),
            ("Tissue nutrient.csv", DataType::TissueAnalysis),
            ("Nutrient report.csv", DataType::SoilChemistry),
            ("Trial Summary - TR-001.xlsx", DataType::TrialSummary),
            ("field photo.JPG", DataType::Photo),
            ("drone/ortho.tiff", DataType::Photo),
            ("random.xyz", DataType::Unknown),
            ("notes", DataType::Unknown),
        ];
        for (name, expected) in cases {
            assert_eq!(classify_filename(name), expected, "{}", name);
        }
    }

    #[test]
    fn trial_summary_wins_over_later_rules() {
        assert_eq!(
            classify_filename("Trial Summary plot layout.xlsx"),
            DataType::TrialSummary
        );
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension("Layer.GeoJSON").as_deref(), Some("geojson"));
        assert_eq!(extension("archive.tar.ZIP").as_deref(), Some("zip"));
        assert_eq!(extension(".hidden"), None);
        assert_eq!(extension("README"), None);
    }

    #[test]
    fn headers_pick_the_best_covering_mapping() {
        let registry = MappingRegistry::builtin();
        let headers: Vec<String> = ["Plot", "Trt", "Rep", "Yield (bu/ac)"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(classify_headers(registry, &headers), DataType::PlotData);

        let headers: Vec<String> = ["Lab ID", "pH", "OM", "P", "K", "CEC"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(classify_headers(registry, &headers), DataType::SoilChemistry);

        let headers = vec!["Weather".to_string()];
        assert_eq!(classify_headers(registry, &headers), DataType::Unknown);
    }
}
