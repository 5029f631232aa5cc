//! No-op backend for when remote copies are intentionally disabled.

use super::{TransferChannel, TransferResult};
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

#[async_trait]
impl TransferChannel for LocalOnly {
    fn backend(&self) -> &'static str {
        "local-only"
    }

    async fn transfer(&self, source: &Path) -> Result<TransferResult> {
        info!("Remote transfer disabled, export kept at {}", source.display());
        Ok(TransferResult::default())
    }
}
