//! Init-config command: write the built-in defaults to disk.

use crate::config::BackupConfig;
use anyhow::bail;
use clap::Args;
use std::path::Path;

/// Arguments for the init-config command
#[derive(Args)]
pub struct InitConfigArgs {
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Run the init-config command
pub async fn run(args: InitConfigArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => BackupConfig::default_path()?,
    };

    if path.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    BackupConfig::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    println!("Set remote.host and remote.path before the first run.");
    Ok(())
}
