//! Command-line interface for archive-backup.
//!
//! One file per subcommand, each exposing `run`.

use crate::config::BackupConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

pub mod init_config;
pub mod run;
pub mod schedule;
pub mod status;

/// archive-backup - change-gated backups of a document archive
#[derive(Parser)]
#[command(name = "archive-backup")]
#[command(about = "Export a document archive and ship it to a remote destination")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the backup pipeline once
    Run(run::RunArgs),
    /// Show the committed watermark, lock holder and latest log
    Status(status::StatusArgs),
    /// Write a default configuration file
    InitConfig(init_config::InitConfigArgs),
    /// Generate systemd service and timer units
    Schedule(schedule::ScheduleArgs),
}

/// Load and pre-flight check the configuration
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<BackupConfig> {
    let config = BackupConfig::load(path).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
