//! Run reports and the per-run log artifact.
//!
//! Every invocation produces exactly one [`RunReport`] and one log file of
//! `"[timestamp] LEVEL: message"` lines. Each line is mirrored into the
//! report and forwarded to `tracing`.

use crate::error::Phase;
use crate::watermark::Watermark;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const LOG_PREFIX: &str = "backup_";
pub const LOG_SUFFIX: &str = ".log";

/// How the pipeline was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Unconditional run
    Full,
    /// Gated on change detection
    Smart,
    /// Export without remote transfer, still commits state
    LocalOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Smart => write!(f, "smart"),
            RunMode::LocalOnly => write!(f, "local-only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Why a failed run failed, beyond the phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Another run is active; schedulers can treat this as "already running"
    LockBusy,
    Timeout,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    Skipped,
    Failed {
        phase: Phase,
        kind: FailureKind,
        reason: String,
    },
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Failed { phase, reason, .. } => write!(f, "failed in {}: {}", phase, reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Size of the export artifact, if measured
    pub artifact_size: Option<u64>,
    pub transferred_size: Option<u64>,
    /// Watermark persisted by this run; `None` unless the commit succeeded
    pub committed_watermark: Option<Watermark>,
    pub log: Vec<LogLine>,
    pub log_file: Option<PathBuf>,
}

impl RunReport {
    /// Process exit code: reflects the pipeline only, never the notification
    pub fn exit_code(&self) -> i32 {
        if self.outcome.is_failed() {
            1
        } else {
            0
        }
    }

    pub fn is_lock_busy(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Failed {
                kind: FailureKind::LockBusy,
                ..
            }
        )
    }

    pub fn duration(&self) -> Duration {
        self.finished_at - self.started_at
    }

    /// The log as it appears in the artifact
    pub fn rendered_log(&self) -> String {
        self.log.iter().map(|l| l.render() + "\n").collect()
    }
}

/// Append-only log for a single run
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    file: Option<File>,
    lines: Vec<LogLine>,
}

impl RunLog {
    /// Open a fresh artifact in `log_dir`. If the file cannot be created the
    /// run continues with an in-memory log only.
    pub fn create(log_dir: &Path, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        let name = format!(
            "{}{}_{}{}",
            LOG_PREFIX,
            started_at.format("%Y%m%d_%H%M%S"),
            &run_id.simple().to_string()[..8],
            LOG_SUFFIX
        );
        let path = log_dir.join(name);

        let opened = fs::create_dir_all(log_dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        match opened {
            Ok(file) => Self {
                path: Some(path),
                file: Some(file),
                lines: Vec::new(),
            },
            Err(e) => {
                warn!("Could not create log file {}: {}", path.display(), e);
                Self::in_memory()
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            lines: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    fn push(&mut self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }

        let line = LogLine {
            timestamp: Utc::now(),
            level,
            message,
        };

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line.render()) {
                warn!("Dropping log file output after write error: {}", e);
                self.file = None;
            }
        }
        self.lines.push(line);
    }

    /// Hand the collected lines to the report and close the file
    pub fn finish(mut self) -> (Vec<LogLine>, Option<PathBuf>) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        (self.lines, self.path)
    }
}

/// Outcome of a retention sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Delete run logs in `log_dir` older than `retention_days`, never touching
/// `keep`. Best-effort: individual failures are counted, not returned.
pub fn prune_logs(log_dir: &Path, retention_days: u32, keep: Option<&Path>) -> PruneSummary {
    let mut summary = PruneSummary::default();
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return summary,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if keep == Some(path.as_path()) {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(_) => {
                summary.failed += 1;
                continue;
            }
        };

        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    warn!("Could not remove old log {}: {}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }
    }

    summary
}

/// Most recent run log in `log_dir`, by file name
pub fn latest_log(log_dir: &Path) -> Option<PathBuf> {
    fs::read_dir(log_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(LOG_PREFIX) && n.ends_with(LOG_SUFFIX))
        })
        .max()
}
