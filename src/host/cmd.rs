//! Privileged host command execution
//!
//! The port between the provisioner and the node's storage tooling
//! (lvm, mkfs, mount, exportfs, showmount, blkid). Backends depend on the
//! trait so tests can substitute a scripted runner.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

// =============================================================================
// Output
// =============================================================================

/// Captured output of a completed host command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Stdout split into lines, trailing newline stripped
    pub lines: Vec<String>,
    /// Raw stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout joined back into one buffer (for JSON report output)
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

// =============================================================================
// Runner Port
// =============================================================================

/// Port for privileged host command execution
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit status is an error carrying the exit code and
    /// stderr; callers never have to inspect a status themselves.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

// =============================================================================
// Host Runner
// =============================================================================

/// Runs commands on the node via tokio::process
#[derive(Debug, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running host command: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::HostCommand {
                program: program.to_string(),
                code: None,
                stderr: format!("failed to spawn: {e}"),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(Error::HostCommand {
                program: program.to_string(),
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines = stdout.lines().map(str::to_string).collect();

        Ok(CommandOutput { lines, stderr })
    }
}

// =============================================================================
// Test Runner
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_captures_stdout_lines() {
        let runner = HostCommandRunner;
        let out = runner.run("sh", &["-c", "echo one; echo two"]).await.unwrap();
        assert_eq!(out.lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_with_code() {
        let runner = HostCommandRunner;
        let err = runner
            .run("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::HostCommand { code: Some(3), ref stderr, .. } if stderr == "boom"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let runner = HostCommandRunner;
        let err = runner.run("definitely-not-a-program", &[]).await.unwrap_err();
        assert_matches!(err, Error::HostCommand { code: None, .. });
    }
}
