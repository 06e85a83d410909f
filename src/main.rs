//! # Field Trial Ingest CLI (`fti`)
//!
//! Operator interface for the ingestion pipeline: database setup, trial
//! registration, file and directory ingestion, GIS conversion, and
//! coverage/audit reports.
//!
//! ## Usage
//!
//! ```bash
//! fti --config ./config/fti.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fti init` | Create the SQLite database and run schema migrations |
//! | `fti trial add <id>` | Register a trial |
//! | `fti ingest <file>` | Ingest one CSV/TSV/XLSX upload |
//! | `fti ingest-dir <dir>` | Ingest every matching file under a directory |
//! | `fti classify <file>...` | Show the detected data type of files |
//! | `fti gis <file>` | Convert a GIS upload into sanitized GeoJSON layers |
//! | `fti coverage <trial>` | Show which data types a trial has |
//! | `fti log` | Show recent uploads |
//! | `fti purge <trial> <type>` | Delete a trial's rows of one type |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use field_trial_ingest::batch::{self, BatchTotals};
use field_trial_ingest::classify::{classify_filename, classify_headers};
use field_trial_ingest::config::{self, Config};
use field_trial_ingest::gis;
use field_trial_ingest::ingest::{IngestRequest, Ingestor};
use field_trial_ingest::mapping::MappingRegistry;
use field_trial_ingest::models::{DataType, FieldValue, IngestStatus, IngestionResult};
use field_trial_ingest::parse::{decode_upload, parse_table};
use field_trial_ingest::stats;
use field_trial_ingest::store::sqlite::SqliteStore;
use field_trial_ingest::store::Store;
use field_trial_ingest::trial_id::normalize_trial_id;
use field_trial_ingest::{db, migrate};

/// Field Trial Ingest: load messy field-trial spreadsheets and map layers
/// into a consistent store.
#[derive(Parser)]
#[command(
    name = "fti",
    about = "Ingestion and geospatial normalization for agricultural field-trial data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fti.toml")]
    config: PathBuf,

    /// Log debug detail to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Manage trials.
    Trial {
        #[command(subcommand)]
        action: TrialAction,
    },

    /// Ingest one file.
    ///
    /// The data type is taken from `--type`, else the filename, else the
    /// header row. The trial is taken from `--trial`, else a Trial ID column.
    Ingest {
        file: PathBuf,

        /// Trial identifier.
        #[arg(long)]
        trial: Option<String>,

        /// Data type tag (e.g. `soil_health`, `plot_data`).
        #[arg(long = "type")]
        data_type: Option<DataType>,

        /// Fixed `field=value` for rows that leave the field empty.
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ingest every file under a directory matching the configured globs.
    IngestDir {
        dir: PathBuf,

        #[arg(long)]
        trial: Option<String>,

        #[arg(long = "type")]
        data_type: Option<DataType>,
    },

    /// Print the detected data type of each file.
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Convert a GIS file into one sanitized `.geojson` per layer.
    Gis {
        file: PathBuf,

        /// Output directory (defaults to `[gis].output_dir`).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show per-data-type coverage for a trial.
    Coverage { trial: String },

    /// Show recent upload log entries.
    Log {
        #[arg(long)]
        trial: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete a trial's rows of one data type and reset its coverage flag.
    Purge {
        trial: String,

        #[arg(value_name = "TYPE")]
        data_type: DataType,
    },
}

#[derive(Subcommand)]
enum TrialAction {
    /// Register a trial so data can be loaded for it.
    Add {
        id: String,

        #[arg(long)]
        name: Option<String>,
    },
    /// List registered trials.
    List,
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].trim().to_string(), s[pos + 1..].to_string()))
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("field_trial_ingest={0},fti={0}", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

fn trial_arg(raw: &str) -> Result<String> {
    normalize_trial_id(raw).with_context(|| format!("Invalid trial id: '{}'", raw))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_result(filename: &str, result: &IngestionResult) {
    println!(
        "{}: {} [{} → {}] {}",
        filename,
        result.status,
        result.data_type,
        result.trial_id.as_deref().unwrap_or("-"),
        result.detail
    );
    for rejection in &result.rejections {
        println!("  {}", rejection.reason);
    }
    if !result.unmapped_headers.is_empty() {
        println!("  unmapped headers: {}", result.unmapped_headers.join(", "));
    }
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(SqliteStore::open(cfg).await?))
}

fn classify_file(path: &Path) -> Result<DataType> {
    let filename = file_name(path);
    let by_name = classify_filename(&filename);
    // Names that are not files on disk are classified by name alone
    if by_name != DataType::Unknown || !path.is_file() {
        return Ok(by_name);
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let content = decode_upload(&filename, bytes)?;
    Ok(match parse_table(&content, &[]) {
        Ok(table) => classify_headers(MappingRegistry::builtin(), &table.headers),
        Err(_) => DataType::Unknown,
    })
}

fn run_gis(cfg: &Config, file: &Path, out: Option<PathBuf>) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let layers = gis::normalize_gis_file(&file_name(file), &bytes)?;

    let out_dir = out.unwrap_or_else(|| cfg.gis.output_dir.clone());
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    for layer in &layers {
        let path = out_dir.join(format!("{}.geojson", layer.name));
        let json = serde_json::to_vec_pretty(&layer.collection.to_geojson())?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "{}: {} of {} features kept → {}",
            layer.name,
            layer.stats.features_after,
            layer.stats.features_before,
            path.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(problems) = MappingRegistry::builtin().validate() {
        bail!("Column mapping registry is inconsistent:\n  {}", problems.join("\n  "));
    }

    // Commands that don't require config
    match &cli.command {
        Commands::Classify { files } => {
            for path in files {
                println!("{}\t{}", path.display(), classify_file(path)?);
            }
            return Ok(());
        }
        Commands::Gis { file, out } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
            return run_gis(&cfg, file, out.clone());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Trial { action } => {
            let store = open_store(&cfg).await?;
            match action {
                TrialAction::Add { id, name } => {
                    let id = trial_arg(&id)?;
                    if store.register_trial(&id, name.as_deref()).await? {
                        println!("Registered trial {}", id);
                    } else {
                        println!("Trial {} already exists", id);
                    }
                }
                TrialAction::List => {
                    for trial in store.trials().await? {
                        println!(
                            "{}\t{}\t{}",
                            trial.id,
                            trial.name.as_deref().unwrap_or(""),
                            trial.created_at.format("%Y-%m-%d")
                        );
                    }
                }
            }
        }
        Commands::Ingest {
            file,
            trial,
            data_type,
            set,
            json,
        } => {
            let store = open_store(&cfg).await?;
            let ingestor = Ingestor::from_config(store, &cfg);

            let filename = file_name(&file);
            let bytes =
                std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let mut request = IngestRequest::new(&filename, decode_upload(&filename, bytes)?);
            request.trial_id = trial;
            request.data_type = data_type;
            for (field, value) in set {
                request = request.default_value(field, FieldValue::Text(value));
            }

            let result = ingestor.ingest(request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&filename, &result);
            }
            if result.status == IngestStatus::Error {
                bail!("Ingestion of {} failed", filename);
            }
        }
        Commands::IngestDir {
            dir,
            trial,
            data_type,
        } => {
            let store = open_store(&cfg).await?;
            let ingestor = Ingestor::from_config(store, &cfg);
            let items =
                batch::ingest_dir(&ingestor, &dir, &cfg.ingest, trial.as_deref(), data_type)
                    .await?;
            for item in &items {
                print_result(&item.file.relative, &item.result);
            }
            let totals = BatchTotals::from_items(&items);
            println!();
            println!(
                "{} files: {} success, {} partial, {} error; {} rows accepted, {} rejected",
                totals.files,
                totals.success,
                totals.partial,
                totals.error,
                totals.records_accepted,
                totals.records_rejected
            );
        }
        Commands::Coverage { trial } => {
            let store = open_store(&cfg).await?;
            print!("{}", stats::coverage_report(store.as_ref(), &trial_arg(&trial)?).await?);
        }
        Commands::Log { trial, limit } => {
            let store = open_store(&cfg).await?;
            let trial = trial.as_deref().map(trial_arg).transpose()?;
            print!("{}", stats::log_report(store.as_ref(), trial.as_deref(), limit).await?);
        }
        Commands::Purge { trial, data_type } => {
            let store = open_store(&cfg).await?;
            let trial = trial_arg(&trial)?;
            let deleted = store.delete_rows(&trial, data_type).await?;
            println!("Deleted {} {} rows for trial {}", deleted, data_type, trial);
        }
        Commands::Classify { .. } | Commands::Gis { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
