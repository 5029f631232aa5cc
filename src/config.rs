//! Static configuration for a backup run.
//!
//! Loaded once at startup from TOML, validated, then passed by reference to
//! every component. Nothing reads ambient settings after this point.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How the export artifact leaves the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMethod {
    Stream,
    Sync,
    LocalOnly,
}

impl std::fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMethod::Stream => write!(f, "stream"),
            BackupMethod::Sync => write!(f, "sync"),
            BackupMethod::LocalOnly => write!(f, "local-only"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_method: BackupMethod,
    pub log_retention_days: u32,
    pub lock_max_age_secs: u64,
    pub paths: PathsConfig,
    pub archive: ArchiveConfig,
    pub export: ExportFlags,
    pub remote: RemoteConfig,
    pub timeouts: TimeoutConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory the archive runtime writes its export into
    pub export_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
}

/// Where and how to reach the archive runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding the compose project of the archive
    pub compose_dir: PathBuf,
    /// Program plus leading arguments, e.g. `["docker", "compose"]`
    pub compose_command: Vec<String>,
    pub webserver_service: String,
    pub db_service: String,
    pub db_user: String,
    pub db_name: String,
    /// Export target as seen from inside the webserver container
    pub exporter_target: String,
    pub change_query: String,
}

/// Options handed to the archive exporter. Each flag is independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFlags {
    pub delete_stale: bool,
    pub use_filename_format: bool,
    pub compare_checksums: bool,
    pub no_archive: bool,
    pub no_thumbnail: bool,
    pub zip: bool,
}

impl ExportFlags {
    /// Command-line switches understood by the exporter, in stable order
    pub fn to_args(&self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.delete_stale {
            args.push("--delete");
        }
        if self.use_filename_format {
            args.push("--use-filename-format");
        }
        if self.compare_checksums {
            args.push("--compare-checksums");
        }
        if self.no_archive {
            args.push("--no-archive");
        }
        if self.no_thumbnail {
            args.push("--no-thumbnail");
        }
        if self.zip {
            args.push("--zip");
        }
        args
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
    pub port: u16,
    /// rclone remote name; when set, `sync` targets a bucket instead of ssh
    pub rclone_remote: Option<String>,
    /// Program and leading arguments used to reach the host for `stream`
    pub ssh_command: Vec<String>,
}

impl RemoteConfig {
    /// `user@host` or just `host`
    pub fn ssh_target(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match self.user.as_deref() {
            Some(user) if !user.is_empty() => format!("{}@{}", user, host),
            _ => host.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub detect: u64,
    pub export: u64,
    pub transfer: u64,
    pub notify: u64,
}

impl TimeoutConfig {
    pub fn detect(&self) -> Duration {
        Duration::from_secs(self.detect)
    }

    pub fn export(&self) -> Duration {
        Duration::from_secs(self.export)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_secs(self.notify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyKind {
    None,
    Telegram,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// KEY=VALUE file providing `BOT_TOKEN` and `CHAT_ID`
    pub credentials_file: Option<PathBuf>,
    /// Notifier program and arguments; the log file path is appended
    pub command: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_method: BackupMethod::Stream,
            log_retention_days: 30,
            lock_max_age_secs: 6 * 60 * 60,
            paths: PathsConfig::default(),
            archive: ArchiveConfig::default(),
            export: ExportFlags::default(),
            remote: RemoteConfig::default(),
            timeouts: TimeoutConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("archive-backup");

        Self {
            export_dir: base.join("export"),
            state_file: base.join("last_backup"),
            lock_file: base.join("backup.lock"),
            log_dir: base.join("logs"),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compose_dir: PathBuf::from("."),
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            webserver_service: "webserver".to_string(),
            db_service: "db".to_string(),
            db_user: "paperless".to_string(),
            db_name: "paperless".to_string(),
            exporter_target: "../export".to_string(),
            change_query: "SELECT MAX(GREATEST(added, modified)) FROM documents_document"
                .to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            path: None,
            port: 22,
            rclone_remote: None,
            ssh_command: vec!["ssh".to_string()],
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            detect: 60,
            export: 2 * 60 * 60,
            transfer: 6 * 60 * 60,
            notify: 30,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::None,
            bot_token: None,
            chat_id: None,
            credentials_file: None,
            command: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Load config from `path`, or from the default location when `None`.
    /// A missing file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !config_path.exists() {
            debug!("Config file {} not found, using defaults", config_path.display());
            return Ok(Self::default());
        }

        debug!("Loading config from {}", config_path.display());
        let content = fs::read_to_string(&config_path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config = toml::from_str(content)?;
        Ok(config)
    }

    /// Write config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::config("Could not determine config directory"))?;

        Ok(config_dir.join("archive-backup").join("config.toml"))
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    /// Pre-flight validation; nothing may run if this fails
    pub fn validate(&self) -> Result<()> {
        if self.backup_method != BackupMethod::LocalOnly {
            let has_path = self.remote.path.as_deref().is_some_and(|p| !p.is_empty());
            if !has_path {
                return Err(Error::config(format!(
                    "remote.path is required for backup_method = {}",
                    self.backup_method
                )));
            }

            let bucket = self.backup_method == BackupMethod::Sync && self.remote.rclone_remote.is_some();
            let has_host = self.remote.host.as_deref().is_some_and(|h| !h.is_empty());
            if !bucket && !has_host {
                return Err(Error::config(format!(
                    "remote.host is required for backup_method = {}",
                    self.backup_method
                )));
            }
        }

        if self.backup_method == BackupMethod::LocalOnly && self.remote.host.is_some() {
            warn!("remote.host is ignored with backup_method = local-only");
        }

        if self.remote.port == 0 {
            return Err(Error::config("remote.port must be greater than 0"));
        }

        if self.lock_max_age_secs == 0 {
            return Err(Error::config("lock_max_age_secs must be greater than 0"));
        }

        let timeouts = [
            ("detect", self.timeouts.detect),
            ("export", self.timeouts.export),
            ("transfer", self.timeouts.transfer),
            ("notify", self.timeouts.notify),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(Error::config(format!("timeouts.{} must be greater than 0", name)));
            }
        }

        if self.backup_method == BackupMethod::Stream && self.remote.ssh_command.is_empty() {
            return Err(Error::config("remote.ssh_command must not be empty"));
        }

        if self.archive.compose_command.is_empty() {
            return Err(Error::config("archive.compose_command must not be empty"));
        }

        match self.notify.kind {
            NotifyKind::None => {}
            NotifyKind::Telegram => {
                self.notify.telegram_credentials()?;
            }
            NotifyKind::Command => {
                if self.notify.command.is_empty() {
                    return Err(Error::config("notify.command is required for kind = command"));
                }
            }
        }

        Ok(())
    }
}

impl NotifyConfig {
    /// Resolve `(bot_token, chat_id)`, inline values taking precedence over
    /// the credentials file.
    pub fn telegram_credentials(&self) -> Result<(String, String)> {
        let from_file = match &self.credentials_file {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    Error::config(format!(
                        "Failed to read credentials file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                parse_key_values(&content)
            }
            None => HashMap::new(),
        };

        let token = self
            .bot_token
            .clone()
            .or_else(|| from_file.get("BOT_TOKEN").cloned())
            .filter(|v| !v.is_empty());
        let chat = self
            .chat_id
            .clone()
            .or_else(|| from_file.get("CHAT_ID").cloned())
            .filter(|v| !v.is_empty());

        match (token, chat) {
            (Some(token), Some(chat)) => Ok((token, chat)),
            _ => Err(Error::config("BOT_TOKEN and CHAT_ID must be set for telegram notifications")),
        }
    }
}

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments
pub fn parse_key_values(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn remote_config() -> BackupConfig {
        let mut config = BackupConfig::default();
        config.remote.host = Some("nas.local".to_string());
        config.remote.user = Some("backup".to_string());
        config.remote.path = Some("/volume1/paperless".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = BackupConfig::default();
        assert_eq!(config.backup_method, BackupMethod::Stream);
        assert_eq!(config.log_retention_days, 30);
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.timeouts.detect, 60);
    }

    #[test]
    fn test_parse_toml() {
        let config = BackupConfig::from_toml(
            r#"
            backup_method = "sync"
            log_retention_days = 7
            lock_max_age_secs = 600

            [export]
            delete_stale = true
            zip = true

            [remote]
            host = "nas"
            path = "/backups"
            port = 2222
            "#,
        )
        .unwrap();

        assert_eq!(config.backup_method, BackupMethod::Sync);
        assert_eq!(config.log_retention_days, 7);
        assert_eq!(config.lock_max_age(), Duration::from_secs(600));
        assert_eq!(config.remote.port, 2222);
        assert!(config.export.delete_stale);
        assert_eq!(config.archive.db_service, "db");
        config.validate().unwrap();
    }

    #[test]
    fn test_export_flags_compose() {
        let flags = ExportFlags {
            delete_stale: true,
            compare_checksums: true,
            no_thumbnail: true,
            ..Default::default()
        };
        assert_eq!(flags.to_args(), vec!["--delete", "--compare-checksums", "--no-thumbnail"]);
        assert!(ExportFlags::default().to_args().is_empty());
    }

    #[test]
    fn test_missing_destination_is_config_error() {
        let config = BackupConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_local_only_needs_no_destination() {
        let config = BackupConfig {
            backup_method: BackupMethod::LocalOnly,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_bucket_sync_needs_no_host() {
        let mut config = BackupConfig {
            backup_method: BackupMethod::Sync,
            ..Default::default()
        };
        config.remote.path = Some("bucket/paperless".to_string());
        config.remote.rclone_remote = Some("s3".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = remote_config();
        config.timeouts.export = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_ssh_command_rejected_for_stream() {
        let mut config = remote_config();
        config.backup_method = BackupMethod::Stream;
        config.remote.ssh_command.clear();
        assert!(config.validate().is_err());

        config.backup_method = BackupMethod::Sync;
        config.validate().unwrap();
    }

    #[test]
    fn test_ssh_target() {
        let config = remote_config();
        assert_eq!(config.remote.ssh_target().as_deref(), Some("backup@nas.local"));
    }

    #[test]
    fn test_telegram_credentials_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let creds = temp_dir.path().join(".telegram-config");
        fs::write(&creds, "# bot\nBOT_TOKEN = 123:abc\n\nCHAT_ID=42\n").unwrap();

        let mut config = remote_config();
        config.notify.kind = NotifyKind::Telegram;
        config.notify.credentials_file = Some(creds);

        let (token, chat) = config.notify.telegram_credentials().unwrap();
        assert_eq!(token, "123:abc");
        assert_eq!(chat, "42");
        config.validate().unwrap();
    }

    #[test]
    fn test_telegram_without_credentials_rejected() {
        let mut config = remote_config();
        config.notify.kind = NotifyKind::Telegram;
        config.notify.bot_token = Some("token".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = remote_config();
        config.save(&path).unwrap();

        let loaded = BackupConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.remote.host, config.remote.host);
        assert_eq!(loaded.paths.state_file, config.paths.state_file);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = BackupConfig::load(Some(&temp_dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.backup_method, BackupMethod::Stream);
    }
}
