//! Differential sync of the export directory.
//!
//! Only changed files move. Partially transferred files are kept on the
//! destination so the next run resumes them instead of starting over.

use super::{TransferChannel, TransferResult};
use crate::process::run_captured;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    /// rsync over ssh to `target:path`
    Ssh {
        target: String,
        port: u16,
        path: String,
    },
    /// rclone to `remote:path`, e.g. an object storage bucket
    Rclone { remote: String, path: String },
}

#[derive(Debug, Clone)]
pub struct SyncTransfer {
    target: SyncTarget,
}

impl SyncTransfer {
    pub fn new(target: SyncTarget) -> Self {
        Self { target }
    }

    fn command(&self, source: &Path) -> Command {
        // Trailing slash: sync the directory's contents, not the directory
        let source = format!("{}/", source.display().to_string().trim_end_matches('/'));

        match &self.target {
            SyncTarget::Ssh { target, port, path } => {
                let mut cmd = Command::new("rsync");
                cmd.args(["-a", "--delete", "--partial", "--stats"])
                    .args(["-e", &format!("ssh -p {} -o BatchMode=yes", port)])
                    .arg(source)
                    .arg(format!("{}:{}/", target, path.trim_end_matches('/')));
                cmd
            }
            SyncTarget::Rclone { remote, path } => {
                let mut cmd = Command::new("rclone");
                cmd.arg("sync")
                    .arg(source)
                    .arg(format!("{}:{}", remote, path))
                    .args(["--checksum", "--retries", "1"]);
                cmd
            }
        }
    }
}

#[async_trait]
impl TransferChannel for SyncTransfer {
    fn backend(&self) -> &'static str {
        match self.target {
            SyncTarget::Ssh { .. } => "rsync",
            SyncTarget::Rclone { .. } => "rclone",
        }
    }

    async fn transfer(&self, source: &Path) -> Result<TransferResult> {
        let backend = self.backend();
        info!("Syncing {} via {}", source.display(), backend);

        let output = run_captured(&mut self.command(source))
            .await
            .map_err(|e| Error::transfer(backend, format!("Failed to execute {}: {}", backend, e)))?;

        if !output.success() {
            return Err(Error::transfer(backend, output.failure_text()));
        }

        Ok(TransferResult {
            size_bytes: parse_rsync_transferred(&output.stdout),
            remote_size_bytes: None,
        })
    }
}

/// "Total transferred file size: 1,234 bytes" from `rsync --stats`
pub fn parse_rsync_transferred(stats: &str) -> Option<u64> {
    stats.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Total transferred file size:")?;
        let digits: String = rest
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == ',')
            .filter(|c| *c != ',')
            .collect();
        digits.parse().ok()
    })
}
