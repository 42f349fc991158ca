use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use migrate_cli::archive::ArchiveReader;
use migrate_cli::backend::{LocalFileClient, PoolConfig, SchemaMetadataService};
use migrate_cli::config;
use migrate_cli::importer::run_import;
use migrate_cli::metadata::MetadataService;
use migrate_cli::pool::resilience::{ConcurrencyConfig, ConcurrencyLimiter};
use migrate_cli::pool::{ConnectionPool, SharedClientPool};
use migrate_cli::report::Reporter;
use migrate_cli::schema;
use migrate_cli::session::{ImportSession, UserMap};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    bundle: PathBuf,
    schema_override_path: Option<PathBuf>,
    options_file: Option<PathBuf>,
    pool_config: PathBuf,
    user_map_path: Option<PathBuf>,
    verbose_report: bool,
    json_report: Option<PathBuf>,
    error_report_path: Option<PathBuf>,
) -> Result<()> {
    let resolved_schema = match &schema_override_path {
        Some(path) => {
            let xml = fs::read_to_string(path)
                .with_context(|| format!("failed to read schema override: {}", path.display()))?;
            schema::parse_schema(&xml).context("failed to parse schema override")?
        }
        None => {
            let mut archive = ArchiveReader::open(&bundle).context("failed to open archive")?;
            schema::parse_schema(&archive.read_schema_xml()?)
                .context("failed to parse the archive's embedded schema")?
        }
    };
    let schema_override = schema_override_path.as_ref().map(|_| resolved_schema.clone());
    let metadata: Arc<dyn MetadataService> = Arc::new(SchemaMetadataService::new(resolved_schema));

    let mut options = config::load_options(options_file.as_deref())
        .context("failed to load migration options")?;
    options.verbose_report = options.verbose_report || verbose_report;

    let pool_config = PoolConfig::load(&pool_config).context("failed to load pool config")?;
    let client = Arc::new(LocalFileClient::open(&pool_config.root).with_context(|| {
        format!(
            "failed to open local store at {}",
            pool_config.root.display()
        )
    })?);
    let limiter = ConcurrencyLimiter::new(ConcurrencyConfig {
        dop: pool_config.dop,
        enabled: true,
    });
    let pool: Arc<dyn ConnectionPool> = Arc::new(SharedClientPool::new(client, limiter));

    let user_map = match user_map_path {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read user map: {}", path.display()))?;
            Some(serde_json::from_str::<UserMap>(&text).context("invalid user map file")?)
        }
        None => None,
    };

    let session = ImportSession::new(options, Utc::now());
    let reporter = Arc::new(Reporter::new());
    let human_sink = reporter.spawn_human_sink();
    let json_sink = json_report
        .as_deref()
        .map(|path| reporter.spawn_json_sink(path))
        .transpose()
        .context("failed to open JSON report sink")?;

    let result = run_import(
        &bundle,
        schema_override,
        pool,
        metadata,
        user_map,
        session,
        reporter,
        CancellationToken::new(),
    )
    .await
    .context("import failed")?;

    let _ = human_sink.await;
    if let Some(handle) = json_sink {
        let _ = handle.await;
    }

    let report = result.report;
    let error_report_path =
        error_report_path.unwrap_or_else(|| with_appended_suffix(&bundle, ".error-report.json"));
    report
        .write_to(&error_report_path)
        .with_context(|| format!("failed to write error report to {}", error_report_path.display()))?;

    if report.total_failed() > 0 {
        println!(
            "{}",
            format!(
                "import completed: {} created, {} updated, {} skipped, {} failed",
                report.total_created(),
                report.total_updated(),
                report.total_skipped(),
                report.total_failed(),
            )
            .yellow()
        );
        for (category, count) in report.top_failure_categories(5) {
            println!("  {category}: {count}");
        }
    } else {
        println!(
            "{}",
            format!(
                "import completed: {} created, {} updated, {} skipped",
                report.total_created(),
                report.total_updated(),
                report.total_skipped(),
            )
            .green()
            .bold()
        );
    }
    println!(
        "mapped ids across {} entity(ies)",
        result.id_map.entities().len()
    );
    println!("error report written to {}", error_report_path.display());

    Ok(())
}

/// Appends `suffix` to `path`'s file name, used to derive the default
/// error-report path from the bundle path (`bundle.zip` ->
/// `bundle.zip.error-report.json`) without disturbing its extension.
fn with_appended_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
