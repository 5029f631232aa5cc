//! Run command: one execution of the backup pipeline.

use crate::export::human_size;
use crate::orchestrator::{CancelHandle, CancelSignal, Orchestrator};
use crate::report::{Outcome, RunMode, RunReport};
use anyhow::Context;
use clap::Args;
use std::path::Path;
use tracing::{info, warn};

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// full ignores change detection, local-only skips the remote transfer
    #[arg(short, long, value_enum, default_value_t = RunMode::Smart)]
    pub mode: RunMode,
}

/// Run the pipeline and return the process exit code
pub async fn run(args: RunArgs, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let config = super::load_config(config_path)?;
    let orchestrator =
        Orchestrator::from_config(&config).context("Failed to set up backup pipeline")?;

    let (handle, cancel) = CancelSignal::new();
    let watcher = tokio::spawn(cancel_on_signal(handle));

    let report = orchestrator.run(args.mode, cancel).await;
    watcher.abort();

    print_summary(&report);
    Ok(report.exit_code())
}

async fn cancel_on_signal(handle: CancelHandle) {
    match shutdown_signal().await {
        Ok(()) => {
            info!("Shutdown signal received, cancelling run");
            handle.cancel();
        }
        Err(e) => warn!("Could not install signal handlers: {}", e),
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn print_summary(report: &RunReport) {
    match &report.outcome {
        Outcome::Success => println!("Backup completed successfully"),
        Outcome::Skipped => println!("Backup skipped: no changes since last run"),
        Outcome::Failed { .. } if report.is_lock_busy() => {
            println!("Backup not started: another run holds the lock")
        }
        Outcome::Failed { phase, reason, .. } => {
            println!("Backup failed in {} phase: {}", phase, reason)
        }
    }

    println!("  Run ID: {}", report.run_id);
    println!("  Mode: {}", report.mode);
    println!("  Duration: {}s", report.duration().num_seconds());
    if let Some(size) = report.artifact_size {
        println!("  Export size: {}", human_size(size));
    }
    if let Some(size) = report.transferred_size {
        println!("  Transferred: {}", human_size(size));
    }
    if let Some(watermark) = &report.committed_watermark {
        println!("  Watermark: {}", watermark);
    }
    if let Some(path) = &report.log_file {
        println!("  Log: {}", path.display());
    }
}
