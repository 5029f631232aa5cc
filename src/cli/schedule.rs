//! Schedule command: systemd units for periodic runs.

use crate::report::RunMode;
use crate::scheduler::{BackupSchedule, BackupScheduler};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the schedule command
#[derive(Args)]
pub struct ScheduleArgs {
    /// Directory for the generated units
    #[arg(short, long)]
    pub output: PathBuf,

    /// Systemd calendar expression
    #[arg(long, default_value = "*-*-* 02:00:00")]
    pub on_calendar: String,

    /// Unit name
    #[arg(long, default_value = "archive-backup")]
    pub name: String,

    /// Mode the timer runs in
    #[arg(long, value_enum, default_value_t = RunMode::Smart)]
    pub mode: RunMode,

    /// User the service runs as
    #[arg(long)]
    pub user: Option<String>,
}

/// Run the schedule command
pub async fn run(args: ScheduleArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let executable = std::env::current_exe().context("Could not locate the running executable")?;

    let mut schedule = BackupSchedule::new(&args.name, &executable)
        .with_schedule(&args.on_calendar)
        .with_mode(args.mode);
    if let Some(config) = config_path {
        let config = std::fs::canonicalize(config).unwrap_or_else(|_| config.to_path_buf());
        schedule = schedule.with_config(&config);
    }
    if let Some(user) = &args.user {
        schedule = schedule.with_user(user);
    }

    let scheduler = BackupScheduler::new(&args.output);
    for warning in scheduler.validate_schedule(&schedule) {
        println!("Warning: {}", warning);
    }

    let output = scheduler.generate_systemd_units(&schedule).await?;

    println!("Generated systemd units:");
    println!("  Service: {}", output.service_path.display());
    println!("  Timer: {}", output.timer_path.display());
    println!();
    println!("To install and enable:");
    for command in &output.install_commands {
        println!("  {}", command);
    }
    Ok(())
}
