//! Operational entry point for the operation pipeline.
//!
//! `run` boots a [`vfp_pipeline::Pipeline`] and keeps its background
//! sweeps (failed-op, abandoned-lock) alive until signaled to stop; the
//! other subcommands are one-shot operator tools against the same
//! storage. Domain crates that register methods on the Operation Map are
//! expected to depend on `vfp-pipeline` directly and wire themselves in
//! before calling `spawn_sweepers`; this binary carries none, so a bare
//! `run` here quarantines every op it sees (no handler is registered for
//! any method) — it exists to exercise and operate the pipeline itself,
//! not to stand in for a deployment.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use vfp_pipeline::{Config, Pipeline};

#[derive(Parser)]
#[command(name = "vfp-daemon")]
#[command(about = "Run or operate the Viewfinder operation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the pipeline and run its background sweeps until interrupted.
    Run,
    /// List quarantined operations for a user.
    QuarantineList { user_id: String },
    /// Clear the quarantine flag on one operation, re-admitting it to the
    /// scheduler.
    QuarantineClear { user_id: String, operation_id: String },
    /// Run pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    vfp_pipeline::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run => cmd_run(&config).await,
        Command::QuarantineList { user_id } => cmd_quarantine_list(&config, &user_id).await,
        Command::QuarantineClear { user_id, operation_id } => {
            cmd_quarantine_clear(&config, &user_id, &operation_id).await
        }
        Command::Migrate => cmd_migrate(&config).await,
    }
}

async fn cmd_run(config: &Config) -> Result<()> {
    let pipeline = Pipeline::connect(config).await?;
    pipeline.spawn_sweepers();

    tracing::info!(worker_id = pipeline.worker_id(), "pipeline running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight operations");
    pipeline.shutdown().await;
    Ok(())
}

async fn cmd_quarantine_list(config: &Config, user_id: &str) -> Result<()> {
    let pipeline = Pipeline::connect(config).await?;
    let ops = pipeline.list_quarantined(user_id).await?;
    println!("{}", serde_json::to_string_pretty(&ops)?);
    Ok(())
}

async fn cmd_quarantine_clear(config: &Config, user_id: &str, operation_id: &str) -> Result<()> {
    let pipeline = Pipeline::connect(config).await?;
    let op = pipeline.clear_quarantine(user_id, operation_id).await?;
    // Give the freshly re-admitted op a moment to be picked up by the
    // MaybeExecuteOp call clear_quarantine already issued before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("{}", serde_json::to_string_pretty(&op)?);
    Ok(())
}

async fn cmd_migrate(config: &Config) -> Result<()> {
    // Pipeline::connect already runs pending migrations on connect; this
    // subcommand exists so an operator can run just that step, separate
    // from booting the daemon.
    let _pipeline = Pipeline::connect(config).await?;
    println!("migrations applied");
    Ok(())
}
