//! Bounded external command execution
//!
//! Runs a program with arguments (no shell), captures stdout and stderr, and
//! kills the child if it outlives its timeout. Callers are sampler threads,
//! so each call drives its own current-thread runtime.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes external commands; swapped out in tests
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_command(program, args, timeout)
    }
}

/// Run `program` with `args`, giving up after `timeout`.
///
/// Blocks the calling thread; must not be called from inside a runtime.
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build command runtime")?;
    runtime.block_on(run_command_async(program, args, timeout))
}

async fn run_command_async(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the output future on timeout kills the child
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| {
            format!(
                "Command timed out after {}s: {} {}",
                timeout.as_secs_f64(),
                program,
                args.join(" ")
            )
        })?
        .with_context(|| format!("Failed to execute command: {} {}", program, args.join(" ")))?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
