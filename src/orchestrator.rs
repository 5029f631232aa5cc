//! The backup pipeline: detect → lock → export → transfer → commit → report.
//!
//! Each phase returns a `Result` tagged with its [`Phase`] so the first
//! fatal error short-circuits the rest. Reporting runs on every path. Nothing
//! is retried inside a run; a failed run leaves the watermark untouched and
//! the next scheduled invocation repeats the work.

use crate::config::{BackupConfig, ExportFlags};
use crate::detect::{should_run, ChangeDetector, DatabaseChangeDetector};
use crate::error::Phase;
use crate::export::{human_size, ComposeExporter, ExportInvoker};
use crate::lock::RunLock;
use crate::notify::{sink_for, NotificationSink};
use crate::report::{prune_logs, FailureKind, Outcome, RunLog, RunMode, RunReport};
use crate::state::{FileStateStore, StateStore};
use crate::transfer::{channel_for, LocalOnly, TransferChannel};
use crate::watermark::Watermark;
use crate::{Error, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Per-run knobs taken from the configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub export_flags: ExportFlags,
    pub lock_max_age: Duration,
    pub detect_timeout: Duration,
    pub export_timeout: Duration,
    pub transfer_timeout: Duration,
    pub notify_timeout: Duration,
    /// `None` keeps the run log in memory only
    pub log_dir: Option<PathBuf>,
    pub log_retention_days: u32,
}

impl RunSettings {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            export_flags: config.export.clone(),
            lock_max_age: config.lock_max_age(),
            detect_timeout: config.timeouts.detect(),
            export_timeout: config.timeouts.export(),
            transfer_timeout: config.timeouts.transfer(),
            notify_timeout: config.timeouts.notify(),
            log_dir: Some(config.paths.log_dir.clone()),
            log_retention_days: config.log_retention_days,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        let config = BackupConfig::default();
        Self {
            log_dir: None,
            ..Self::from_config(&config)
        }
    }
}

/// Sending half of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Observed by the orchestrator between and during phases
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), Self(rx))
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A fatal error together with the phase it ends the run in
#[derive(Debug)]
struct Failure {
    phase: Phase,
    error: Error,
}

impl Failure {
    fn at(phase: Phase) -> impl FnOnce(Error) -> Failure {
        move |error| Failure { phase, error }
    }

    fn kind(&self) -> FailureKind {
        match self.error {
            Error::LockBusy { .. } => FailureKind::LockBusy,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::Error,
        }
    }

    fn into_outcome(self) -> Outcome {
        Outcome::Failed {
            phase: self.phase,
            kind: self.kind(),
            reason: self.error.reason(),
        }
    }
}

/// Sizes and commit result gathered while the pipeline runs
#[derive(Debug, Default)]
struct Progress {
    artifact_size: Option<u64>,
    transferred_size: Option<u64>,
    committed: Option<Watermark>,
}

pub struct Orchestrator {
    detector: Box<dyn ChangeDetector>,
    exporter: Box<dyn ExportInvoker>,
    transfer: Box<dyn TransferChannel>,
    state: Box<dyn StateStore>,
    lock: RunLock,
    notifier: Option<Box<dyn NotificationSink>>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        detector: Box<dyn ChangeDetector>,
        exporter: Box<dyn ExportInvoker>,
        transfer: Box<dyn TransferChannel>,
        state: Box<dyn StateStore>,
        lock: RunLock,
        settings: RunSettings,
    ) -> Self {
        Self {
            detector,
            exporter,
            transfer,
            state,
            lock,
            notifier: None,
            settings,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Wire up the production collaborators from a validated configuration
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        let settings = RunSettings::from_config(config);
        let orchestrator = Self::new(
            Box::new(DatabaseChangeDetector::new(&config.archive)),
            Box::new(ComposeExporter::new(&config.archive, &config.paths.export_dir)),
            channel_for(config)?,
            Box::new(FileStateStore::new(&config.paths.state_file)),
            RunLock::new(&config.paths.lock_file),
            settings,
        );

        Ok(match sink_for(&config.notify, config.timeouts.notify())? {
            Some(sink) => orchestrator.with_notifier(sink),
            None => orchestrator,
        })
    }

    /// Execute one run. Always returns a report; the caller derives the
    /// exit code from it.
    pub async fn run(&self, mode: RunMode, mut cancel: CancelSignal) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut log = match &self.settings.log_dir {
            Some(dir) => RunLog::create(dir, run_id, started_at),
            None => RunLog::in_memory(),
        };

        log.info(format!("Starting {} backup run {}", mode, run_id));

        if let Some(dir) = &self.settings.log_dir {
            let pruned = prune_logs(dir, self.settings.log_retention_days, log.path());
            if pruned.removed > 0 {
                log.info(format!(
                    "Removed {} log file(s) older than {} days",
                    pruned.removed, self.settings.log_retention_days
                ));
            }
            if pruned.failed > 0 {
                log.warn(format!("Could not prune {} old log file(s)", pruned.failed));
            }
        }

        let mut progress = Progress::default();
        let outcome = match self.execute(mode, &mut log, &mut cancel, &mut progress).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                log.error(format!("Backup failed in {} phase: {}", failure.phase, failure.error));
                failure.into_outcome()
            }
        };

        match &outcome {
            Outcome::Success => log.info("Backup Completed Successfully"),
            Outcome::Skipped => log.info("Backup skipped, nothing to do"),
            Outcome::Failed { .. } => log.error("Backup Failed"),
        }

        let mut report = RunReport {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            outcome,
            artifact_size: progress.artifact_size,
            transferred_size: progress.transferred_size,
            committed_watermark: progress.committed,
            log: log.lines().to_vec(),
            log_file: log.path().map(|p| p.to_path_buf()),
        };

        self.deliver(&report, &mut log).await;

        let (lines, _) = log.finish();
        report.log = lines;
        report
    }

    /// Hand the report to the sink. Never fails the run; a cancelled run
    /// still gets its notification attempt.
    async fn deliver(&self, report: &RunReport, log: &mut RunLog) {
        let Some(sink) = &self.notifier else {
            return;
        };

        let limit = self.settings.notify_timeout;
        let result = match tokio::time::timeout(limit, sink.notify(report)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                phase: Phase::Report,
                after: limit,
            }),
        };

        match result {
            Ok(()) => debug!("Report delivered via {}", sink.name()),
            Err(e) => log.warn(format!("Notification via {} failed: {}", sink.name(), e)),
        }
    }

    async fn execute(
        &self,
        mode: RunMode,
        log: &mut RunLog,
        cancel: &mut CancelSignal,
        progress: &mut Progress,
    ) -> std::result::Result<Outcome, Failure> {
        let captured = match mode {
            RunMode::Smart => {
                let limit = self.settings.detect_timeout;
                let last = guarded(Phase::Detect, limit, cancel, self.state.load())
                    .await
                    .map_err(Failure::at(Phase::Detect))?;
                let latest = guarded(Phase::Detect, limit, cancel, self.detector.latest_change())
                    .await
                    .map_err(Failure::at(Phase::Detect))?;

                log.info(format!("Last backup watermark: {}", last));
                log.info(format!("Latest change in archive: {}", latest));

                if !should_run(&latest, &last) {
                    log.info("No changes detected since last backup");
                    return Ok(Outcome::Skipped);
                }
                log.info("Changes detected, starting backup");
                latest
            }
            RunMode::Full | RunMode::LocalOnly => {
                log.info(format!("Mode {}: skipping change detection", mode));
                // Taken before the export so edits made during the run stay
                // above the committed watermark
                Watermark::now()
            }
        };

        if cancel.is_cancelled() {
            return Err(Failure {
                phase: Phase::Lock,
                error: Error::Cancelled { phase: Phase::Lock },
            });
        }

        let guard = match self.lock.acquire(self.settings.lock_max_age) {
            Ok(guard) => guard,
            Err(error) => {
                if let Error::LockBusy { .. } = error {
                    log.error("Another backup run is already in progress");
                }
                return Err(Failure {
                    phase: Phase::Lock,
                    error,
                });
            }
        };

        if let Some(reclaimed) = guard.reclaimed() {
            log.warn(format!(
                "Reclaimed stale lock held for {}s by {}",
                reclaimed.age_secs,
                reclaimed
                    .previous_owner
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown owner".to_string())
            ));
        }
        log.info(format!("Acquired run lock {}", self.lock.path().display()));

        let result = self.locked_phases(mode, captured, log, cancel, progress).await;

        // Released before the outcome is reported
        match guard.release() {
            Ok(()) => log.info("Released run lock"),
            Err(e) => log.warn(format!("Failed to release run lock: {}", e)),
        }

        result
    }

    async fn locked_phases(
        &self,
        mode: RunMode,
        captured: Watermark,
        log: &mut RunLog,
        cancel: &mut CancelSignal,
        progress: &mut Progress,
    ) -> std::result::Result<Outcome, Failure> {
        let flags = &self.settings.export_flags;
        log.info(format!("Starting document export {:?}", flags.to_args()));

        let export = guarded(
            Phase::Export,
            self.settings.export_timeout,
            cancel,
            self.exporter.export(flags),
        )
        .await
        .map_err(Failure::at(Phase::Export))?;

        progress.artifact_size = export.size_bytes;
        match export.size_bytes {
            Some(size) => log.info(format!("Export completed ({})", human_size(size))),
            None => log.info("Export completed (size unavailable)"),
        }

        let local = LocalOnly;
        let channel: &dyn TransferChannel = match mode {
            RunMode::LocalOnly => &local,
            RunMode::Full | RunMode::Smart => self.transfer.as_ref(),
        };

        log.info(format!("Transferring export via {}", channel.backend()));
        let transferred = guarded(
            Phase::Transfer,
            self.settings.transfer_timeout,
            cancel,
            channel.transfer(self.exporter.artifact_dir()),
        )
        .await
        .map_err(Failure::at(Phase::Transfer))?;

        progress.transferred_size = transferred.size_bytes;
        if let Some(size) = transferred.size_bytes {
            log.info(format!("Transferred {}", human_size(size)));
        }
        if let Some(size) = transferred.remote_size_bytes {
            log.info(format!("Remote destination size: {}", human_size(size)));
        }
        log.info(format!("Transfer via {} completed", channel.backend()));

        // A cancelled run is never committed
        if cancel.is_cancelled() {
            return Err(Failure {
                phase: Phase::Commit,
                error: Error::Cancelled {
                    phase: Phase::Commit,
                },
            });
        }

        progress.committed = self.commit(captured, log).await;

        Ok(Outcome::Success)
    }

    /// Persist `candidate` without ever moving the watermark backwards.
    /// Failure is logged; the backup has already been delivered.
    async fn commit(&self, candidate: Watermark, log: &mut RunLog) -> Option<Watermark> {
        let stored = match self.state.load().await {
            Ok(stored) => stored,
            Err(e) => {
                log.warn(format!("Could not read stored watermark before commit: {}", e));
                Watermark::Epoch
            }
        };

        let target = if candidate < stored {
            log.warn(format!(
                "Keeping stored watermark {} (newer than {})",
                stored, candidate
            ));
            stored
        } else {
            candidate
        };

        match self.state.commit(&target).await {
            Ok(()) => {
                log.info(format!("Committed watermark {}", target));
                Some(target)
            }
            Err(e) => {
                log.warn(format!("{}; next run will repeat this backup", e));
                None
            }
        }
    }
}

/// Race a phase against its timeout and the cancellation signal
async fn guarded<T, F>(phase: Phase, limit: Duration, cancel: &mut CancelSignal, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled { phase }),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { phase, after: limit }),
        },
    }
}
