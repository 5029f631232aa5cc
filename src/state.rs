//! Persistence of the last successfully backed-up watermark.

use crate::watermark::Watermark;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last committed watermark, [`Watermark::Epoch`] if none was ever stored
    async fn load(&self) -> Result<Watermark>;

    /// Replace the stored watermark. Readers see the old or the new value,
    /// never a partial write.
    async fn commit(&self, watermark: &Watermark) -> Result<()>;
}

/// Single human-readable value in a plain text file
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomic(&self, contents: &str) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        // Same directory so the rename never crosses filesystems
        let temp_path = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Watermark> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Watermark::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting from epoch", self.path.display());
                Ok(Watermark::Epoch)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, watermark: &Watermark) -> Result<()> {
        self.write_atomic(&format!("{}\n", watermark))
            .await
            .map_err(|e| Error::StateCommit {
                reason: format!("{}: {}", self.path.display(), e),
            })?;
        debug!("Committed watermark {} to {}", watermark, self.path.display());
        Ok(())
    }
}
