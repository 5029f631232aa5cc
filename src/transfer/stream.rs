//! Stream the export as one tar stream over ssh, no local archive written.

use super::{shell_quote, TransferChannel, TransferResult};
use crate::process::{command_from_argv, run_captured, CommandOutput};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

const BACKEND: &str = "stream";

#[derive(Debug, Clone)]
pub struct StreamTransfer {
    target: String,
    port: u16,
    remote_path: String,
    ssh_command: Vec<String>,
}

impl StreamTransfer {
    pub fn new(target: String, port: u16, remote_path: String) -> Self {
        Self {
            target,
            port,
            remote_path,
            ssh_command: vec!["ssh".to_string()],
        }
    }

    /// Replace the `ssh` program, e.g. with a wrapper adding options
    pub fn with_ssh_command(mut self, argv: Vec<String>) -> Self {
        if !argv.is_empty() {
            self.ssh_command = argv;
        }
        self
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = command_from_argv(&self.ssh_command).unwrap_or_else(|| Command::new("ssh"));
        cmd.args(["-p", &self.port.to_string()])
            .args(["-o", "BatchMode=yes"])
            .arg(&self.target)
            .arg(remote_command);
        cmd
    }

    fn clear_command(&self) -> String {
        let path = shell_quote(&self.remote_path);
        format!("mkdir -p {path} && find {path} -mindepth 1 -delete")
    }

    fn extract_command(&self) -> String {
        format!("tar -xf - -C {}", shell_quote(&self.remote_path))
    }

    fn size_command(&self) -> String {
        format!("du -sb {}", shell_quote(&self.remote_path))
    }

    /// Empty the destination. Streaming on top of an old tree would leave a
    /// mix of old and new files, so failure here aborts the transfer.
    async fn clear_remote(&self) -> Result<()> {
        let output = run_captured(&mut self.ssh(&self.clear_command()))
            .await
            .map_err(|e| Error::transfer(BACKEND, format!("Failed to execute ssh: {}", e)))?;

        if !output.success() {
            return Err(Error::transfer(
                BACKEND,
                format!("could not clear remote destination: {}", output.failure_text()),
            ));
        }
        Ok(())
    }

    async fn stream(&self, source: &Path) -> Result<u64> {
        let spawn_err = |what: &str, e: std::io::Error| {
            Error::transfer(BACKEND, format!("Failed to start {}: {}", what, e))
        };

        let mut tar = Command::new("tar")
            .arg("-C")
            .arg(source)
            .args(["-cf", "-", "."])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err("tar", e))?;

        let mut ssh = self
            .ssh(&self.extract_command())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err("ssh", e))?;

        let mut reader = tar
            .stdout
            .take()
            .ok_or_else(|| Error::transfer(BACKEND, "tar stdout unavailable"))?;
        let mut writer = ssh
            .stdin
            .take()
            .ok_or_else(|| Error::transfer(BACKEND, "ssh stdin unavailable"))?;

        let tar_stderr = tar.stderr.take();
        let ssh_stderr = ssh.stderr.take();

        // stderr is drained alongside the copy so a chatty tar cannot fill
        // its pipe and stall the stream
        let (copied, tar_err, ssh_err) = tokio::join!(
            async move {
                let copied = tokio::io::copy(&mut reader, &mut writer).await;
                // Closing stdin lets the remote tar see end of stream; closing
                // our read end stops a local tar still writing after ssh died
                drop(writer);
                drop(reader);
                copied
            },
            drain(tar_stderr),
            drain(ssh_stderr),
        );

        let tar_out = CommandOutput {
            status: tar.wait().await?,
            stdout: String::new(),
            stderr: tar_err,
        };
        let ssh_out = CommandOutput {
            status: ssh.wait().await?,
            stdout: String::new(),
            stderr: ssh_err,
        };

        if !ssh_out.success() {
            return Err(Error::transfer(
                BACKEND,
                format!("remote extract failed: {}", ssh_out.failure_text()),
            ));
        }
        if !tar_out.success() {
            return Err(Error::transfer(
                BACKEND,
                format!("local tar failed: {}", tar_out.failure_text()),
            ));
        }

        copied.map_err(|e| Error::transfer(BACKEND, format!("stream interrupted: {}", e)))
    }

    /// Best-effort remote size check, never fails the transfer
    async fn remote_size(&self) -> Option<u64> {
        match run_captured(&mut self.ssh(&self.size_command())).await {
            Ok(output) if output.success() => parse_du_bytes(&output.stdout),
            Ok(output) => {
                warn!("Remote size check failed: {}", output.failure_text());
                None
            }
            Err(e) => {
                warn!("Remote size check failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl TransferChannel for StreamTransfer {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn transfer(&self, source: &Path) -> Result<TransferResult> {
        info!("Clearing {}:{}", self.target, self.remote_path);
        self.clear_remote().await?;

        info!("Streaming {} to {}:{}", source.display(), self.target, self.remote_path);
        let streamed = self.stream(source).await?;
        debug!("Streamed {} bytes", streamed);

        Ok(TransferResult {
            size_bytes: Some(streamed),
            remote_size_bytes: self.remote_size().await,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Could not read child stderr: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// First field of `du -sb` output
pub fn parse_du_bytes(stdout: &str) -> Option<u64> {
    stdout.split_whitespace().next()?.parse().ok()
}
