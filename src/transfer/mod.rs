//! Moving the export artifact off the machine.
//!
//! The backend is picked once from configuration; the orchestrator only sees
//! the [`TransferChannel`] capability.

pub mod local;
pub mod stream;
pub mod sync;

use crate::config::{BackupConfig, BackupMethod};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use local::LocalOnly;
pub use stream::StreamTransfer;
pub use sync::{SyncTarget, SyncTransfer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Bytes moved to the destination, when the backend can tell
    pub size_bytes: Option<u64>,
    /// Size reported by the destination after the transfer. Diagnostic only.
    pub remote_size_bytes: Option<u64>,
}

#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Backend name used in logs and `TransferError`s
    fn backend(&self) -> &'static str;

    async fn transfer(&self, source: &Path) -> Result<TransferResult>;
}

/// Build the configured backend. Fails on a missing destination, which
/// `BackupConfig::validate` normally catches first.
pub fn channel_for(config: &BackupConfig) -> Result<Box<dyn TransferChannel>> {
    let remote = &config.remote;
    let path = || {
        remote
            .path
            .clone()
            .ok_or_else(|| Error::config("remote.path is not set"))
    };
    let target = || {
        remote
            .ssh_target()
            .ok_or_else(|| Error::config("remote.host is not set"))
    };

    let channel: Box<dyn TransferChannel> = match config.backup_method {
        BackupMethod::LocalOnly => Box::new(LocalOnly),
        BackupMethod::Stream => Box::new(
            StreamTransfer::new(target()?, remote.port, path()?).with_ssh_command(remote.ssh_command.clone()),
        ),
        BackupMethod::Sync => {
            let sync_target = match &remote.rclone_remote {
                Some(name) => SyncTarget::Rclone {
                    remote: name.clone(),
                    path: path()?,
                },
                None => SyncTarget::Ssh {
                    target: target()?,
                    port: remote.port,
                    path: path()?,
                },
            };
            Box::new(SyncTransfer::new(sync_target))
        }
    };

    Ok(channel)
}

/// Single-quote `value` for a POSIX shell on the remote side
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/backups/paperless"), "'/backups/paperless'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_channel_selection() {
        let mut config = BackupConfig::default();
        config.remote.host = Some("nas".to_string());
        config.remote.path = Some("/backups".to_string());

        config.backup_method = BackupMethod::Stream;
        assert_eq!(channel_for(&config).unwrap().backend(), "stream");

        config.backup_method = BackupMethod::Sync;
        assert_eq!(channel_for(&config).unwrap().backend(), "rsync");

        config.remote.rclone_remote = Some("b2".to_string());
        assert_eq!(channel_for(&config).unwrap().backend(), "rclone");

        config.backup_method = BackupMethod::LocalOnly;
        assert_eq!(channel_for(&config).unwrap().backend(), "local-only");
    }

    #[test]
    fn test_missing_destination_rejected() {
        let config = BackupConfig::default();
        assert!(channel_for(&config).is_err());
    }
}
