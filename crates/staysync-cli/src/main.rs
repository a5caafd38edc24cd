use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use staysync_storage::PgRecordStore;
use staysync_sync::{build_postgres_reconciler, build_scheduler, report_recent_markdown, run_sync_once, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "staysync")]
#[command(about = "Reservation calendar feed sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled feed once.
    Sync {
        /// Feed registry to use instead of STAYSYNC_FEEDS_FILE.
        #[arg(long)]
        feeds: Option<PathBuf>,
    },
    /// Run syncs on STAYSYNC_SYNC_CRON until interrupted.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staysync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { feeds: None }) {
        Commands::Sync { feeds } => {
            if let Some(feeds) = feeds {
                config.feeds_file = feeds;
            }
            let reconciler = build_postgres_reconciler(&config).await?;
            let summary = run_sync_once(&config, &reconciler).await?;
            let totals = summary.totals();
            println!(
                "sync complete: run_id={} feeds={} created={} modified={} removed={} suppressed={} skipped={}",
                summary.run_id,
                summary.feeds.len(),
                totals.created,
                totals.modified,
                totals.removed,
                totals.suppressed_duplicates,
                totals.skipped_errors
            );
            let failed = summary.failed_feeds();
            if !failed.is_empty() {
                for feed in &failed {
                    eprintln!(
                        "feed failed: {} ({:?}): {}",
                        feed.feed_url,
                        feed.status,
                        feed.error.as_deref().unwrap_or("unknown error")
                    );
                }
                bail!("{} of {} feeds failed", failed.len(), summary.feeds.len());
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                tracing::warn!("STAYSYNC_SCHEDULER_ENABLED is not set; starting the scheduler anyway");
            }
            let reconciler = Arc::new(build_postgres_reconciler(&config).await?);
            let cron = config.sync_cron.clone();
            let sched = build_scheduler(config, reconciler).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutting down scheduler");
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to the reservation store")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
