//! Column mapping registry.
//!
//! One [`ColumnMapping`] per tabular [`DataType`] describes which raw
//! header spellings map to which canonical field, how each field is typed,
//! which fields are required, where to look for a trial identifier, and
//! which fields form the natural key used for duplicate detection.
//!
//! The registry is built once per process ([`MappingRegistry::builtin`])
//! and never mutated. Alias lookup tables are compiled when a mapping is
//! constructed, so per-row work is plain hash lookups.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use crate::models::{DataType, FieldType};

/// One canonical field of a mapping.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    /// Accepted raw header spellings. The canonical name is always accepted.
    pub aliases: &'static [&'static str],
}

const fn field(
    name: &'static str,
    field_type: FieldType,
    aliases: &'static [&'static str],
) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        aliases,
    }
}

/// Reduce a header to its matching key: lowercase, with every run of
/// whitespace or punctuation collapsed to a single `_`.
///
/// `" Sample No "`, `"sample_no"` and `"SAMPLE-NO."` all become `sample_no`.
pub fn header_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Declarative schema for one data type.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub data_type: DataType,
    pub fields: &'static [FieldSpec],
    pub required_fields: &'static [&'static str],
    pub trial_id_candidates: &'static [&'static str],
    /// Fields whose values identify a real-world record for this type.
    pub natural_key: &'static [&'static str],
    /// Preferred worksheet names when the upload is a workbook.
    pub sheet_hints: &'static [&'static str],
    alias_index: HashMap<String, &'static str>,
    alias_conflicts: Vec<String>,
}

/// Which source header feeds each canonical field of a table.
#[derive(Debug, Clone, Default)]
pub struct HeaderBinding {
    bound: HashMap<&'static str, String>,
    pub unmapped: Vec<String>,
}

impl HeaderBinding {
    /// The source header bound to `field`, if any.
    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.bound.get(field).map(|s| s.as_str())
    }

    pub fn is_bound(&self, field: &str) -> bool {
        self.bound.contains_key(field)
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }
}

impl ColumnMapping {
    pub fn new(
        data_type: DataType,
        fields: &'static [FieldSpec],
        required_fields: &'static [&'static str],
        trial_id_candidates: &'static [&'static str],
        natural_key: &'static [&'static str],
        sheet_hints: &'static [&'static str],
    ) -> Self {
        let mut alias_index: HashMap<String, &'static str> = HashMap::new();
        let mut alias_conflicts = Vec::new();
        for spec in fields {
            let spellings = std::iter::once(spec.name).chain(spec.aliases.iter().copied());
            for spelling in spellings {
                let key = header_key(spelling);
                match alias_index.get(&key) {
                    Some(existing) if *existing != spec.name => {
                        alias_conflicts.push(format!(
                            "alias '{}' maps to both '{}' and '{}'",
                            spelling, existing, spec.name
                        ));
                    }
                    Some(_) => {}
                    None => {
                        alias_index.insert(key, spec.name);
                    }
                }
            }
        }

        Self {
            data_type,
            fields,
            required_fields,
            trial_id_candidates,
            natural_key,
            sheet_hints,
            alias_index,
            alias_conflicts,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required_fields.contains(&name)
    }

    /// Canonical field a raw header maps to, if any.
    pub fn resolve_header(&self, raw_header: &str) -> Option<&'static str> {
        self.alias_index.get(&header_key(raw_header)).copied()
    }

    /// Bind the table's headers to canonical fields. The first header that
    /// resolves to a field wins; later ones count as unmapped.
    pub fn bind(&self, headers: &[String]) -> HeaderBinding {
        let mut binding = HeaderBinding::default();
        for header in headers {
            match self.resolve_header(header) {
                Some(canonical) if !binding.bound.contains_key(canonical) => {
                    binding.bound.insert(canonical, header.clone());
                }
                _ => binding.unmapped.push(header.clone()),
            }
        }
        binding
    }

    /// Human-readable list of spellings accepted for `field`.
    pub fn accepted_spellings(&self, field: &str) -> String {
        match self.field(field) {
            Some(spec) => std::iter::once(spec.name)
                .chain(spec.aliases.iter().copied())
                .map(|s| format!("'{}'", s))
                .collect::<Vec<_>>()
                .join(", "),
            None => String::new(),
        }
    }

    /// Self-consistency problems, empty when the mapping is sound.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.alias_conflicts.clone();
        let mut seen = BTreeSet::new();
        for spec in self.fields {
            if !seen.insert(spec.name) {
                problems.push(format!("field '{}' declared twice", spec.name));
            }
        }
        let referenced = self
            .required_fields
            .iter()
            .map(|f| ("required", *f))
            .chain(self.trial_id_candidates.iter().map(|f| ("trial id candidate", *f)))
            .chain(self.natural_key.iter().map(|f| ("natural key", *f)));
        for (role, name) in referenced {
            if self.field(name).is_none() {
                problems.push(format!("{} field '{}' has no type or aliases", role, name));
            }
        }
        if self.natural_key.is_empty() {
            problems.push("natural key is empty".to_string());
        }
        problems
            .into_iter()
            .map(|p| format!("{}: {}", self.data_type, p))
            .collect()
    }
}

/// All column mappings, one per tabular data type.
#[derive(Debug)]
pub struct MappingRegistry {
    mappings: Vec<ColumnMapping>,
}

impl MappingRegistry {
    pub fn new(mappings: Vec<ColumnMapping>) -> Self {
        Self { mappings }
    }

    /// The process-wide built-in registry.
    pub fn builtin() -> &'static MappingRegistry {
        static REGISTRY: OnceLock<MappingRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| MappingRegistry::new(builtin_mappings()))
    }

    pub fn get(&self, data_type: DataType) -> Option<&ColumnMapping> {
        self.mappings.iter().find(|m| m.data_type == data_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.mappings.iter()
    }

    /// Check every mapping once; returns all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems: Vec<String> = self.mappings.iter().flat_map(|m| m.problems()).collect();
        let mut seen = BTreeSet::new();
        for m in &self.mappings {
            if !m.data_type.is_tabular() {
                problems.push(format!("{}: not a tabular data type", m.data_type));
            }
            if !seen.insert(m.data_type) {
                problems.push(format!("{}: mapped twice", m.data_type));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

// =============================================================================
// Built-in mappings
// =============================================================================

const TRIAL_ID: FieldSpec = field(
    "trial_id",
    FieldType::Text,
    &["trial id", "trial", "trial no", "trial number", "trial #", "study id"],
);
const TRIAL_CODE: FieldSpec = field(
    "trial_code",
    FieldType::Text,
    &["trial code", "protocol", "protocol id", "protocol no", "study code", "project code"],
);
const SAMPLE_NO: FieldSpec = field(
    "sample_no",
    FieldType::Text,
    &[
        "sample no", "sample number", "sample #", "sample id", "sample", "sample name",
        "lab id", "lab no", "lab number",
    ],
);
const SAMPLE_DATE: FieldSpec = field(
    "sample_date",
    FieldType::Date,
    &["date", "sample date", "sampling date", "date sampled", "collection date", "date collected"],
);
const PLOT_ID: FieldSpec = field(
    "plot_id",
    FieldType::Text,
    &["plot", "plot id", "plot no", "plot number", "plot #"],
);
const BLOCK: FieldSpec = field("block", FieldType::Text, &["blk", "rep block"]);
const TREATMENT: FieldSpec = field(
    "treatment",
    FieldType::Text,
    &["trt", "trt no", "trt #", "treatment no", "treatment number", "treatment name"],
);
const REPLICATION: FieldSpec = field(
    "replication",
    FieldType::Integer,
    &["rep", "replicate", "rep no", "rep #"],
);
const DEPTH: FieldSpec = field(
    "depth",
    FieldType::Text,
    &["sample depth", "depth cm", "depth in", "depth inches", "soil depth"],
);
const PH: FieldSpec = field("ph", FieldType::Decimal, &["soil ph", "ph 1 1", "water ph"]);
const ORGANIC_MATTER: FieldSpec = field(
    "organic_matter",
    FieldType::Decimal,
    &["om", "organic matter", "om %", "organic matter %", "som"],
);

static SOIL_HEALTH_FIELDS: [FieldSpec; 15] = [
    TRIAL_ID,
    TRIAL_CODE,
    SAMPLE_NO,
    SAMPLE_DATE,
    PLOT_ID,
    BLOCK,
    TREATMENT,
    DEPTH,
    field(
        "respiration_co2",
        FieldType::Decimal,
        &["co2 respiration", "1 day co2", "1 day co2 c", "soil respiration", "respiration"],
    ),
    field(
        "wsoc",
        FieldType::Decimal,
        &["water extractable organic carbon", "weoc", "water extractable oc"],
    ),
    field(
        "won",
        FieldType::Decimal,
        &["water extractable organic nitrogen", "weon", "water extractable on"],
    ),
    field(
        "soil_health_score",
        FieldType::Decimal,
        &["soil health calculation", "health score", "soil health", "shc"],
    ),
    field(
        "active_carbon",
        FieldType::Decimal,
        &["poxc", "permanganate oxidizable carbon", "active c"],
    ),
    field(
        "aggregate_stability",
        FieldType::Decimal,
        &["wet aggregate stability", "was", "aggregate stability %"],
    ),
    ORGANIC_MATTER,
];

static SOIL_CHEMISTRY_FIELDS: [FieldSpec; 18] = [
    TRIAL_ID,
    TRIAL_CODE,
    SAMPLE_NO,
    SAMPLE_DATE,
    PLOT_ID,
    BLOCK,
    TREATMENT,
    DEPTH,
    PH,
    ORGANIC_MATTER,
    field("nitrate_n", FieldType::Decimal, &["no3 n", "nitrate", "nitrate nitrogen", "no3"]),
    field("phosphorus", FieldType::Decimal, &["p", "p ppm", "bray p", "olsen p", "mehlich p"]),
    field("potassium", FieldType::Decimal, &["k", "k ppm"]),
    field("calcium", FieldType::Decimal, &["ca", "ca ppm"]),
    field("magnesium", FieldType::Decimal, &["mg", "mg ppm"]),
    field("sulfur", FieldType::Decimal, &["s", "s ppm", "sulphur"]),
    field("zinc", FieldType::Decimal, &["zn", "zn ppm"]),
    field("cec", FieldType::Decimal, &["cation exchange capacity", "cec meq 100g"]),
];

static PLOT_DATA_FIELDS: [FieldSpec; 13] = [
    TRIAL_ID,
    TRIAL_CODE,
    PLOT_ID,
    BLOCK,
    TREATMENT,
    REPLICATION,
    field("crop", FieldType::Text, &["crop type", "commodity"]),
    field(
        "assessment_date",
        FieldType::Date,
        &["date", "assessment date", "rating date", "harvest date", "observation date"],
    ),
    field(
        "yield",
        FieldType::Decimal,
        &["yield bu ac", "yield bu a", "yield t ha", "yield kg ha", "grain yield"],
    ),
    field("moisture", FieldType::Decimal, &["moisture %", "grain moisture", "harvest moisture"]),
    field("stand_count", FieldType::Integer, &["stand", "plant stand", "plant count", "stand count"]),
    field("plant_height", FieldType::Decimal, &["height", "plant height cm", "plant height in"]),
    field("notes", FieldType::Text, &["comments", "comment", "note", "remarks"]),
];

static SAMPLE_METADATA_FIELDS: [FieldSpec; 12] = [
    TRIAL_ID,
    TRIAL_CODE,
    SAMPLE_NO,
    SAMPLE_DATE,
    PLOT_ID,
    BLOCK,
    TREATMENT,
    DEPTH,
    field("sample_type", FieldType::Text, &["type", "matrix", "sample kind"]),
    field("latitude", FieldType::Decimal, &["lat", "y"]),
    field("longitude", FieldType::Decimal, &["lon", "long", "lng", "x"]),
    field("notes", FieldType::Text, &["comments", "comment", "note", "remarks"]),
];

static TISSUE_ANALYSIS_FIELDS: [FieldSpec; 20] = [
    TRIAL_ID,
    TRIAL_CODE,
    SAMPLE_NO,
    SAMPLE_DATE,
    PLOT_ID,
    TREATMENT,
    field("plant_part", FieldType::Text, &["tissue", "tissue type", "part", "plant tissue"]),
    field("growth_stage", FieldType::Text, &["stage", "crop stage", "growth stage"]),
    field("nitrogen", FieldType::Decimal, &["n", "n %", "total n"]),
    field("phosphorus", FieldType::Decimal, &["p", "p %"]),
    field("potassium", FieldType::Decimal, &["k", "k %"]),
    field("sulfur", FieldType::Decimal, &["s", "s %"]),
    field("calcium", FieldType::Decimal, &["ca", "ca %"]),
    field("magnesium", FieldType::Decimal, &["mg", "mg %"]),
    field("zinc", FieldType::Decimal, &["zn", "zn ppm"]),
    field("manganese", FieldType::Decimal, &["mn", "mn ppm"]),
    field("iron", FieldType::Decimal, &["fe", "fe ppm"]),
    field("copper", FieldType::Decimal, &["cu", "cu ppm"]),
    field("boron", FieldType::Decimal, &["b", "b ppm"]),
    field("notes", FieldType::Text, &["comments", "comment", "note", "remarks"]),
];

const TRIAL_ID_CANDIDATES: &[&str] = &["trial_id", "trial_code"];

fn builtin_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new(
            DataType::SoilHealth,
            &SOIL_HEALTH_FIELDS,
            &["sample_no"],
            TRIAL_ID_CANDIDATES,
            &["sample_no", "sample_date", "depth"],
            &["soil health", "results", "data"],
        ),
        ColumnMapping::new(
            DataType::SoilChemistry,
            &SOIL_CHEMISTRY_FIELDS,
            &["sample_no"],
            TRIAL_ID_CANDIDATES,
            &["sample_no", "sample_date", "depth"],
            &["soil analysis", "results", "data"],
        ),
        ColumnMapping::new(
            DataType::PlotData,
            &PLOT_DATA_FIELDS,
            &["plot_id"],
            TRIAL_ID_CANDIDATES,
            &["plot_id", "assessment_date"],
            &["plot data", "plots", "data"],
        ),
        ColumnMapping::new(
            DataType::SampleMetadata,
            &SAMPLE_METADATA_FIELDS,
            &["sample_no"],
            TRIAL_ID_CANDIDATES,
            &["sample_no"],
            &["samples", "sample metadata", "data"],
        ),
        ColumnMapping::new(
            DataType::TissueAnalysis,
            &TISSUE_ANALYSIS_FIELDS,
            &["sample_no"],
            TRIAL_ID_CANDIDATES,
            &["sample_no", "sample_date", "plant_part"],
            &["tissue", "results", "data"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_self_consistent() {
        let registry = MappingRegistry::builtin();
        assert_eq!(registry.validate(), Ok(()));
        for dt in DataType::ALL {
            assert_eq!(registry.get(dt).is_some(), dt.is_tabular(), "{}", dt);
        }
    }

    #[test]
    fn header_key_ignores_case_padding_and_punctuation() {
        assert_eq!(header_key(" Sample No "), "sample_no");
        assert_eq!(header_key("SAMPLE-NO."), "sample_no");
        assert_eq!(header_key("sample_no"), "sample_no");
        assert_eq!(header_key("Yield (bu/ac)"), "yield_bu_ac");
        assert_eq!(header_key("  "), "");
    }

    #[test]
    fn headers_resolve_through_aliases() {
        let mapping = MappingRegistry::builtin()
            .get(DataType::SampleMetadata)
            .unwrap();
        for raw in [" Sample No ", "sample no", "SAMPLE_NO", "Sample #", "Lab ID"] {
            assert_eq!(mapping.resolve_header(raw), Some("sample_no"), "{:?}", raw);
        }
        assert_eq!(mapping.resolve_header("Date"), Some("sample_date"));
        assert_eq!(mapping.resolve_header("Block"), Some("block"));
        assert_eq!(mapping.resolve_header("Weather"), None);
    }

    #[test]
    fn bind_keeps_first_header_and_reports_the_rest() {
        let mapping = MappingRegistry::builtin()
            .get(DataType::PlotData)
            .unwrap();
        let headers: Vec<String> = ["Plot", "Plot No", "Yield (bu/ac)", "Weather"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let binding = mapping.bind(&headers);
        assert_eq!(binding.header_for("plot_id"), Some("Plot"));
        assert_eq!(binding.header_for("yield"), Some("Yield (bu/ac)"));
        assert_eq!(binding.unmapped, vec!["Plot No".to_string(), "Weather".to_string()]);
    }

    #[test]
    fn inconsistent_mapping_is_reported() {
        static BROKEN: [FieldSpec; 2] = [
            field("a", FieldType::Text, &["shared"]),
            field("b", FieldType::Text, &["shared"]),
        ];
        let mapping = ColumnMapping::new(DataType::PlotData, &BROKEN, &["missing"], &[], &["a"], &[]);
        let problems = mapping.problems();
        assert!(problems.iter().any(|p| p.contains("maps to both")));
        assert!(problems.iter().any(|p| p.contains("required field 'missing'")));
    }
}
