//! Shell-out seam.
//!
//! Supervisor and gateway binaries are driven through [`CommandRunner`] so
//! the managers stay testable: production wires [`SystemRunner`], tests
//! inject a scripted runner that records invocations and returns canned
//! output.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing stdout/stderr. Spawn failures
    /// (missing binary, permissions) surface as errors; a non-zero exit is
    /// reported through [`CommandOutput`], not as an error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands on the host via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::System(format!("failed to spawn `{} {}`: {}", program, args.join(" "), e))
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Map a failed invocation to a [`Error::Supervisor`] carrying the command
/// line, stderr, and exit code.
pub fn supervisor_error(program: &str, args: &[&str], output: &CommandOutput) -> Error {
    Error::Supervisor {
        command: format!("{} {}", program, args.join(" ")),
        stderr: if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        },
        exit_code: output.exit_code,
    }
}
