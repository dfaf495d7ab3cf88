use std::sync::Arc;

use anyhow::Result;
use cannon_ingest::{build_scheduler, IngestConfig, IngestPipeline};
use cannon_notify::NotifyConfig;
use cannon_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, Level};

#[derive(Debug, Parser)]
#[command(name = "cannon")]
#[command(about = "TheCannon housing alerts service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print the summary.
    Ingest,
    /// Serve the HTTP API, with the cron scheduler if enabled.
    Serve,
    /// Run only the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();
    let notify = NotifyConfig::from_env();
    let pipeline = Arc::new(IngestPipeline::from_config(&config, &notify)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest => {
            let summary = pipeline.run_and_record().await?;
            println!(
                "ingestion complete: new={} sent={} errors={}",
                summary.listings_processed,
                summary.notifications_sent,
                summary.notification_errors
            );
        }
        Commands::Serve => {
            if config.scheduler_enabled {
                let scheduler = build_scheduler(pipeline.clone(), &config.ingest_cron).await?;
                scheduler.start().await?;
                info!(cron = %config.ingest_cron, "ingestion scheduler started");
            }
            let state = AppState::new(pipeline.store(), pipeline);
            cannon_web::serve_from_env(state).await?;
        }
        Commands::Schedule => {
            let scheduler = build_scheduler(pipeline, &config.ingest_cron).await?;
            scheduler.start().await?;
            info!(cron = %config.ingest_cron, "ingestion scheduler started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
    }

    Ok(())
}
