//! # archive-backup
//!
//! Change-gated backups of a self-hosted document archive.
//!
//! Each run asks the archive's database whether anything changed since the
//! last committed watermark, triggers the archive's own exporter, ships the
//! export to a remote destination and only then advances the watermark.
//!
//! ## Features
//!
//! - **Change detection**: skip the export entirely when nothing changed
//! - **Run lock**: overlapping runs are refused, abandoned locks reclaimed
//! - **Transfer backends**: tar over ssh, rsync/rclone sync, or local only
//! - **Atomic state**: the watermark file is never observed half-written
//! - **Reporting**: one log artifact per run, optional Telegram or command notifier
//! - **Scheduling**: systemd unit generation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archive_backup::{BackupConfig, CancelSignal, Orchestrator, RunMode};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = BackupConfig::load(None)?;
//! config.validate()?;
//!
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let report = orchestrator.run(RunMode::Smart, CancelSignal::never()).await;
//! println!("Backup {}", report.outcome);
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod export;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod state;
pub mod transfer;
pub mod watermark;

// Re-export commonly used types
pub use config::{BackupConfig, BackupMethod};
pub use detect::ChangeDetector;
pub use error::{Error, Phase, Result};
pub use export::ExportInvoker;
pub use lock::RunLock;
pub use notify::NotificationSink;
pub use orchestrator::{CancelHandle, CancelSignal, Orchestrator, RunSettings};
pub use report::{FailureKind, Outcome, RunMode, RunReport};
pub use state::StateStore;
pub use transfer::TransferChannel;
pub use watermark::Watermark;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
