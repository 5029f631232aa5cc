//! Thin wrappers around the external programs the pipeline drives.
//!
//! Every child is spawned with `kill_on_drop(true)`: when a phase times out
//! or the run is cancelled the future owning the child is dropped and the
//! process goes with it.

use crate::config::ArchiveConfig;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished child process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Human-readable cause for a failed command: stderr when present,
    /// otherwise the exit status.
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with {}", self.status)
        } else {
            stderr.to_string()
        }
    }
}

/// Build a command from an argv slice. Returns `None` for an empty slice.
pub fn command_from_argv(argv: &[String]) -> Option<Command> {
    let (program, args) = argv.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Some(cmd)
}

/// Run a command to completion, capturing stdout and stderr
pub async fn run_captured(cmd: &mut Command) -> std::io::Result<CommandOutput> {
    debug!("Running {:?}", cmd.as_std());

    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Handle on the compose project running the archive
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    command: Vec<String>,
    project_dir: PathBuf,
}

impl ComposeRuntime {
    pub fn new(command: Vec<String>, project_dir: PathBuf) -> Self {
        Self {
            command,
            project_dir,
        }
    }

    pub fn from_config(archive: &ArchiveConfig) -> Self {
        Self::new(archive.compose_command.clone(), archive.compose_dir.clone())
    }

    /// `<compose> exec -T <service> <args..>` rooted at the project directory
    pub fn exec(&self, service: &str, args: &[&str]) -> Command {
        let (program, leading) = match self.command.split_first() {
            Some((program, leading)) => (program.as_str(), leading),
            None => ("docker", &[][..]),
        };

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(["exec", "-T", service])
            .args(args)
            .current_dir(&self.project_dir);
        cmd
    }
}
