//! Status command: what the last runs left behind.

use crate::lock::{LockState, RunLock};
use crate::report::latest_log;
use crate::state::{FileStateStore, StateStore};
use chrono::Utc;
use clap::Args;
use std::path::Path;
use std::time::Duration;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Print the latest run log after the summary
    #[arg(long)]
    pub show_log: bool,
}

/// Run the status command
pub async fn run(args: StatusArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;

    let store = FileStateStore::new(&config.paths.state_file);
    let watermark = store.load().await?;
    println!("Backup method: {}", config.backup_method);
    if watermark.is_epoch() {
        println!("Last backup: never");
    } else {
        println!("Last backup watermark: {}", watermark);
    }

    let lock = RunLock::new(&config.paths.lock_file);
    match lock.inspect() {
        LockState::Free => println!("Lock: free"),
        LockState::Held(marker) => {
            let age = marker.age(Utc::now()).num_seconds();
            let max_age = Duration::from_secs(config.lock_max_age_secs);
            let stale = if marker.is_stale(Utc::now(), max_age) {
                " (stale, will be reclaimed)"
            } else {
                ""
            };
            println!(
                "Lock: held by pid {} (run {}) for {}s{}",
                marker.pid, marker.owner_id, age, stale
            );
        }
        LockState::Unreadable => println!("Lock: present but unreadable ({})", lock.path().display()),
    }

    match latest_log(&config.paths.log_dir) {
        Some(path) => {
            println!("Latest log: {}", path.display());
            if args.show_log {
                println!();
                print!("{}", tokio::fs::read_to_string(&path).await?);
            }
        }
        None => println!("Latest log: none in {}", config.paths.log_dir.display()),
    }

    Ok(())
}
