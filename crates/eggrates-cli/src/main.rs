use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eggrates_cleanup::{build_scheduler, pipeline_from_env, CleanupConfig};
use eggrates_storage::PgStorage;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "eggrates-cli")]
#[command(about = "City name cleanup for the egg rate tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the read-only duplicate analysis
    Analyze,
    /// Preview the cleanup, or execute it with --run
    Cleanup {
        #[arg(long)]
        run: bool,
    },
    /// Print redirect rules for retired coded-city URLs
    Redirections,
    Migrate,
    Serve,
    /// Run the cleanup on the configured cron until interrupted
    Schedule,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Analyze) {
        Commands::Analyze => {
            let pipeline = pipeline_from_env().await?;
            print_json(&pipeline.analyze().await?)?;
        }
        Commands::Cleanup { run: false } => {
            let pipeline = pipeline_from_env().await?;
            print_json(&pipeline.preview().await?)?;
        }
        Commands::Cleanup { run: true } => {
            let pipeline = pipeline_from_env().await?;
            let report = pipeline.run().await;
            print_json(&report)?;
            if !report.success {
                anyhow::bail!("cleanup failed: {}", report.errors.join("; "));
            }
        }
        Commands::Redirections => {
            let pipeline = pipeline_from_env().await?;
            print_json(&pipeline.redirections().await?)?;
        }
        Commands::Migrate => {
            let config = CleanupConfig::from_env();
            let pg = PgStorage::connect(&config.database_url, 1).await?;
            pg.migrate().await?;
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let scheduler = build_scheduler(Arc::clone(&pipeline)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            eggrates_web::serve(pipeline).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled; set EGGRATES_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
