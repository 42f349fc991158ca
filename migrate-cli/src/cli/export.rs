use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use migrate_cli::backend::{LocalFileClient, PoolConfig};
use migrate_cli::exporter::run_export;
use migrate_cli::pool::resilience::{ConcurrencyConfig, ConcurrencyLimiter};
use migrate_cli::pool::{ConnectionPool, SharedClientPool};
use migrate_cli::report::Reporter;
use migrate_cli::schema;
use migrate_cli::session::{retry_policy, MigrationOptions};

pub async fn run(
    schema_path: PathBuf,
    out: PathBuf,
    pool_config: PathBuf,
    page_size: u32,
) -> Result<()> {
    let schema_xml = fs::read_to_string(&schema_path)
        .with_context(|| format!("failed to read schema file: {}", schema_path.display()))?;
    let source_schema = schema::parse_schema(&schema_xml).context("failed to parse schema")?;

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

    let reporter = Arc::new(Reporter::new());
    let sink = reporter.spawn_human_sink();
    let retry = Arc::new(retry_policy(&MigrationOptions::default()));

    let manifest = run_export(
        &source_schema,
        &schema_xml,
        pool,
        page_size,
        &out,
        reporter,
        CancellationToken::new(),
        retry,
    )
    .await
    .context("export failed")?;

    let _ = sink.await;

    let failed = manifest
        .entities
        .values()
        .filter(|v| v.starts_with("failed"))
        .count();
    if manifest.aborted {
        println!("{}", "export aborted".red().bold());
    } else if failed > 0 {
        println!(
            "{}",
            format!("export completed with {failed} entity failure(s)").yellow()
        );
    } else {
        println!("{}", "export completed".green().bold());
    }
    println!("archive written to {}", out.display());
    Ok(())
}
