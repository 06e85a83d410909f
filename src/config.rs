use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::FieldValue;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub gis: GisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Fixed values merged into every row's null fields.
    #[serde(default)]
    pub defaults: BTreeMap<String, FieldValue>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            defaults: BTreeMap::new(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.csv".to_string(),
        "**/*.tsv".to_string(),
        "**/*.txt".to_string(),
        "**/*.xlsx".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct GisConfig {
    #[serde(default = "default_gis_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for GisConfig {
    fn default() -> Self {
        Self {
            output_dir: default_gis_output_dir(),
        }
    }
}

fn default_gis_output_dir() -> PathBuf {
    PathBuf::from("./data/layers")
}

impl Config {
    /// Defaults for commands that do not need a config file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/trials.sqlite"),
            },
            ingest: IngestConfig::default(),
            gis: GisConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.ingest.max_upload_bytes == 0 {
        anyhow::bail!("ingest.max_upload_bytes must be > 0");
    }

    for pattern in config
        .ingest
        .include_globs
        .iter()
        .chain(config.ingest.exclude_globs.iter())
    {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid glob pattern in [ingest]: '{}'", pattern))?;
    }

    Ok(config)
}
