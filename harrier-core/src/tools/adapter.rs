//! External tool execution boundary.
//!
//! Agents never shell out directly. Every external invocation goes through a
//! [`ToolAdapter`], which gives the runtime one place to enforce timeouts,
//! capture output, and record the invocation in the audit trail.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured output stays readable in the store; anything past this is cut.
const MAX_CAPTURE_LENGTH: usize = 64 * 1024;

/// Outcome of a single external tool invocation.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Process exit code, or -1 if the process was killed by a signal.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Boundary between agent logic and external tool processes.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Adapter name, recorded alongside each invocation.
    fn name(&self) -> &str;

    /// Run `command` with `args`, killing the process if it outlives `timeout`.
    async fn invoke(&self, command: &str, args: &[String], timeout: Duration)
        -> Result<ExecOutcome>;
}

/// Runs tools as local subprocesses.
///
/// An optional allow-list restricts which binaries agents may launch; with no
/// list configured, any command is permitted.
pub struct ProcessAdapter {
    allowed: Option<Vec<String>>,
}

impl ProcessAdapter {
    pub fn new() -> Self {
        Self { allowed: None }
    }

    /// Restrict invocations to the given command names.
    pub fn with_allowed_commands(commands: Vec<String>) -> Self {
        Self {
            allowed: Some(commands),
        }
    }

    fn check_allowed(&self, command: &str) -> Result<()> {
        if let Some(allowed) = &self.allowed {
            if !allowed.iter().any(|c| c == command) {
                return Err(Error::Tool(format!(
                    "command '{}' is not in the allowed list",
                    command
                )));
            }
        }
        Ok(())
    }
}

impl Default for ProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        self.check_allowed(command)?;

        debug!(command, ?args, timeout_secs = timeout.as_secs(), "invoking tool");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::Tool(format!("failed to spawn '{}': {}", command, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Tool(format!(
                    "'{}' exceeded timeout of {}s",
                    command,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Tool(format!("failed waiting for '{}': {}", command, e)))?;

        let exit_code = output.status.code().map_or(-1, i64::from);
        let stdout = truncate_capture(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_capture(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutcome {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Char-safe truncation to avoid splitting multi-byte UTF-8 sequences.
fn truncate_capture(raw: &str) -> String {
    if raw.len() <= MAX_CAPTURE_LENGTH {
        return raw.to_string();
    }
    let safe: String = raw
        .char_indices()
        .take_while(|(i, _)| *i < MAX_CAPTURE_LENGTH)
        .map(|(_, c)| c)
        .collect();
    format!("{}\n\n[OUTPUT TRUNCATED - {} bytes total]", safe, raw.len())
}
