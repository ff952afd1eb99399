use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use oppsync::config;
use oppsync::db;
use oppsync::reconcile::Reconciler;

#[derive(Debug, Parser)]
#[command(author, version, about = "Keeps local candidate opportunities in step with the CRM")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let reconciler = Reconciler::from_config(&cfg, pool)?;
    let interval = Duration::from_secs(cfg.sync.incremental_interval_secs);
    info!(instance = %cfg.app.instance_name, ?interval, "starting incremental sync loop");

    let worker = reconciler.clone();
    let sync_loop = tokio::spawn(async move {
        loop {
            match worker.trigger_incremental_sync().await {
                Ok(Some(job)) => {
                    let summary = job.finish().await;
                    info!(state = ?summary.status.state, ticks = summary.status.ticks, "{}", summary.describe());
                }
                Ok(None) => {}
                Err(err) => error!(error = %err, "incremental sync could not start"),
            }
            tokio::time::sleep(interval).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    sync_loop.abort();
    let status = reconciler.status().await;
    info!(
        processed = status.items_processed,
        updated = status.items_updated,
        failed = status.items_failed,
        "final totals"
    );
    Ok(())
}
