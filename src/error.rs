//! Error types for the backup pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pipeline phase a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Detect,
    Lock,
    Export,
    Transfer,
    Commit,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Detect => "detect",
            Phase::Lock => "lock",
            Phase::Export => "export",
            Phase::Transfer => "transfer",
            Phase::Commit => "commit",
            Phase::Report => "report",
        };
        f.write_str(name)
    }
}

/// Main error type for backup operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Change detection failed: {reason}")]
    DetectionFailure { reason: String },

    #[error("Another run holds the lock (owner {owner}, acquired {age_secs}s ago)")]
    LockBusy { owner: String, age_secs: i64 },

    #[error("Export failed: {reason}")]
    Export { reason: String },

    #[error("Transfer via {backend} failed: {detail}")]
    Transfer { backend: String, detail: String },

    #[error("Failed to commit watermark: {reason}")]
    StateCommit { reason: String },

    #[error("Notification failed: {reason}")]
    Notification { reason: String },

    #[error("{phase} phase timed out after {}s", after.as_secs())]
    Timeout { phase: Phase, after: Duration },

    #[error("Run cancelled during {phase} phase")]
    Cancelled { phase: Phase },
}

impl Error {
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub fn detection(reason: impl Into<String>) -> Self {
        Error::DetectionFailure {
            reason: reason.into(),
        }
    }

    pub fn export(reason: impl Into<String>) -> Self {
        Error::Export {
            reason: reason.into(),
        }
    }

    pub fn transfer(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Transfer {
            backend: backend.into(),
            detail: detail.into(),
        }
    }

    pub fn notification(reason: impl Into<String>) -> Self {
        Error::Notification {
            reason: reason.into(),
        }
    }

    /// Short cause text for reports, without the phase prefix the
    /// `Display` impl adds.
    pub fn reason(&self) -> String {
        match self {
            Error::Configuration { reason }
            | Error::DetectionFailure { reason }
            | Error::Export { reason }
            | Error::StateCommit { reason }
            | Error::Notification { reason } => reason.clone(),
            Error::Transfer { backend, detail } => format!("{}: {}", backend, detail),
            other => other.to_string(),
        }
    }
}

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strips_prefix() {
        assert_eq!(Error::export("disk full").reason(), "disk full");
        assert_eq!(
            Error::transfer("stream", "connection refused").reason(),
            "stream: connection refused"
        );
    }

    #[test]
    fn test_timeout_names_phase() {
        let err = Error::Timeout {
            phase: Phase::Transfer,
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "transfer phase timed out after 90s");
    }

    #[test]
    fn test_lock_busy_display() {
        let err = Error::LockBusy {
            owner: "abc".to_string(),
            age_secs: 12,
        };
        assert!(err.to_string().contains("abc"));
    }
}
