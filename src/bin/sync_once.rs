use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use oppsync::config;
use oppsync::db;
use oppsync::reconcile::Reconciler;
use oppsync::runner::RunnerState;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single opportunity sync and exit when it finishes"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the run summary as JSON instead of a one-line count
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upsert every candidate opportunity under the given CRM job ids
    Full {
        /// Comma separated CRM job opportunity ids
        #[arg(long, value_delimiter = ',', required = true)]
        job_ids: Vec<String>,
    },
    /// Re-check every locally open opportunity
    Incremental,
    /// Apply open CRM records changed since the last run
    ChangedSince,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let reconciler = Reconciler::from_config(&cfg, pool)?;

    let job = match args.command {
        Command::Full { job_ids } => reconciler.trigger_full_sync(job_ids).await?,
        Command::Incremental => reconciler.trigger_incremental_sync().await?,
        Command::ChangedSince => reconciler.trigger_changed_since_sync().await?,
    };
    let Some(job) = job else {
        warn!("another instance is running this sync; nothing to do");
        return Ok(());
    };

    info!(runner = job.runner().name(), "waiting for sync to finish");
    let summary = job.finish().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.describe());
    }
    if summary.status.state != RunnerState::Completed {
        bail!(
            "sync ended {:?} after {} ticks",
            summary.status.state,
            summary.status.ticks
        );
    }
    Ok(())
}
