//! Triggering the archive runtime's document export.

use crate::config::{ArchiveConfig, ExportFlags};
use crate::process::{run_captured, ComposeRuntime};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    /// Size of the produced artifact, when it could be measured
    pub size_bytes: Option<u64>,
}

/// Produces an export artifact at a location the transfer channel reads from
#[async_trait]
pub trait ExportInvoker: Send + Sync {
    /// Directory holding the artifact after a successful export
    fn artifact_dir(&self) -> &Path;

    async fn export(&self, flags: &ExportFlags) -> Result<ExportResult>;
}

/// Runs `document_exporter` inside the archive's webserver container
#[derive(Debug, Clone)]
pub struct ComposeExporter {
    runtime: ComposeRuntime,
    service: String,
    target: String,
    artifact_dir: PathBuf,
}

impl ComposeExporter {
    pub fn new(archive: &ArchiveConfig, artifact_dir: &Path) -> Self {
        Self {
            runtime: ComposeRuntime::from_config(archive),
            service: archive.webserver_service.clone(),
            target: archive.exporter_target.clone(),
            artifact_dir: artifact_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ExportInvoker for ComposeExporter {
    fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    async fn export(&self, flags: &ExportFlags) -> Result<ExportResult> {
        let mut args = vec!["document_exporter", self.target.as_str()];
        args.extend(flags.to_args());
        debug!("Export arguments: {:?}", args);

        let mut cmd = self.runtime.exec(&self.service, &args);
        let output = run_captured(&mut cmd)
            .await
            .map_err(|e| Error::export(format!("Failed to execute exporter: {}", e)))?;

        // Partial output from a failed export is never treated as usable
        if !output.success() {
            return Err(Error::export(output.failure_text()));
        }

        Ok(ExportResult {
            size_bytes: measure_dir(&self.artifact_dir),
        })
    }
}

/// Total size in bytes of all regular files below `dir`. Any error makes the
/// measurement unavailable rather than failing the caller.
pub fn measure_dir(dir: &Path) -> Option<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not measure {}: {}", dir.display(), e);
                return None;
            }
        };
        if entry.file_type().is_file() {
            match entry.metadata() {
                Ok(meta) => total += meta.len(),
                Err(e) => {
                    warn!("Could not stat {}: {}", entry.path().display(), e);
                    return None;
                }
            }
        }
    }
    Some(total)
}

/// Format a byte count the way `du -h` does
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_measure_dir_sums_nested_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("originals")).unwrap();
        fs::write(temp_dir.path().join("manifest.json"), vec![0u8; 100]).unwrap();
        fs::write(temp_dir.path().join("originals").join("0001.pdf"), vec![0u8; 1000]).unwrap();

        assert_eq!(measure_dir(temp_dir.path()), Some(1100));
    }

    #[test]
    fn test_measure_missing_dir_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(measure_dir(&temp_dir.path().join("missing")), None);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1536), "1.5K");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0G");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exporter_is_export_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive = ArchiveConfig {
            compose_command: vec!["false".to_string()],
            compose_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let exporter = ComposeExporter::new(&archive, temp_dir.path());

        let err = exporter.export(&ExportFlags::default()).await.unwrap_err();
        assert!(matches!(err, Error::Export { .. }));
    }
}
