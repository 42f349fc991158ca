mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Export {
            schema,
            out,
            pool_config,
            page_size,
        } => cli::export::run(schema, out, pool_config, page_size).await,
        Commands::Import {
            bundle,
            schema_override,
            options_file,
            pool_config,
            user_map,
            verbose_report,
            json_report,
            error_report,
        } => {
            cli::import::run(
                bundle,
                schema_override,
                options_file,
                pool_config,
                user_map,
                verbose_report,
                json_report,
                error_report,
            )
            .await
        }
    }
}
