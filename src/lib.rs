//! # Field Trial Ingest
//!
//! Ingestion and geospatial normalization for agricultural field-trial
//! data.
//!
//! Lab results, plot assessments and trial summaries arrive as CSV/TSV or
//! XLSX files with inconsistent headers. Each upload is classified into a
//! [`DataType`](models::DataType), parsed, normalized against that type's
//! [`ColumnMapping`](mapping::ColumnMapping) and loaded idempotently, so
//! re-uploading a file never duplicates rows. Map layers (GeoJSON, KML,
//! KMZ, shapefiles) are converted into sanitized GeoJSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │ classify │──▶│  parse   │──▶│ normalize │──▶│  loader  │──▶ Store
//! └──────────┘   └──────────┘   └───────────┘   └──────────┘   (SQLite /
//!       │                                                        memory)
//!       └──▶ summary (trial summary workbooks)
//!
//! GIS upload ──▶ gis::{geojson,kml,shapefile} ──▶ sanitize ──▶ GeoJSON layers
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fti init                                   # create database
//! fti trial add T-2024-01 --name "North farm"
//! fti ingest "Soil Health Data.csv" --trial T-2024-01
//! fti coverage T-2024-01
//! fti gis "Field Boundaries.zip" --out ./layers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomies |
//! | [`mapping`] | Per-type canonical fields and header aliases |
//! | [`classify`] | Filename and header classification |
//! | [`parse`] | Delimited text and XLSX readers |
//! | [`trial_id`] | Trial identifier resolution |
//! | [`normalize`] | Type coercion and row validation |
//! | [`summary`] | Trial summary workbook extraction |
//! | [`loader`] | Natural keys and idempotent loading |
//! | [`store`] | Storage trait, SQLite and in-memory stores |
//! | [`ingest`] | Per-upload orchestration |
//! | [`batch`] | Directory ingestion |
//! | [`gis`] | GIS layer normalization |
//! | [`stats`] | Coverage and upload-log reports |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod batch;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod gis;
pub mod ingest;
pub mod loader;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parse;
pub mod stats;
pub mod store;
pub mod summary;
pub mod trial_id;
