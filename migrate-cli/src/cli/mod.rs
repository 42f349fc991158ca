//! CLI surface: `migrate export` / `migrate import`. Thin by design — each
//! subcommand's handler builds the engine's inputs from flags and an
//! optional config file, then hands off to the engine proper.

pub mod export;
pub mod import;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "migrate",
    about = "Moves records between environments of a structured business-data backend",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export every schema-declared entity and in-scope M:N relationship
    /// from the source pool into a single archive.
    Export {
        /// Path to the `data_schema.xml`-shaped schema document.
        #[arg(long)]
        schema: PathBuf,
        /// Output path for the archive.
        #[arg(long)]
        out: PathBuf,
        /// Connection pool config (points at the reference backend's data
        /// directory).
        #[arg(long = "pool-config")]
        pool_config: PathBuf,
        #[arg(long = "page-size", default_value_t = 5000)]
        page_size: u32,
    },
    /// Import an archive into a target pool, preserving referential
    /// integrity across dependency cycles.
    Import {
        /// Path to the archive produced by `migrate export`.
        #[arg(long)]
        bundle: PathBuf,
        /// Use this schema instead of the one embedded in the archive.
        #[arg(long = "schema-override")]
        schema_override: Option<PathBuf>,
        /// TOML file of `MigrationOptions` overrides.
        #[arg(long = "options-file")]
        options_file: Option<PathBuf>,
        #[arg(long = "pool-config")]
        pool_config: PathBuf,
        /// Optional owner-id remap file (JSON: `{"ownerFallback": "...",
        /// "map": {"<source-id>": "<target-id>"}}`).
        #[arg(long = "user-map")]
        user_map: Option<PathBuf>,
        /// Include successfully-imported record ids in the error report.
        #[arg(long = "verbose-report")]
        verbose_report: bool,
        /// Write progress events as JSON lines to this file in addition to
        /// the human-readable stream.
        #[arg(long = "json-report")]
        json_report: Option<PathBuf>,
        /// Where to write the v1.1 error report artifact. Defaults to
        /// `<bundle>.error-report.json`.
        #[arg(long = "error-report")]
        error_report: Option<PathBuf>,
    },
}
