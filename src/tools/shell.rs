//! Shell command execution for the `execute_shell` action.
//!
//! Commands reach this point only after the safety gate; they are passed to
//! `sh -c` unmodified. The child is killed if the deadline passes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, TetradError};

/// Exit status conventionally used for Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Captured result of a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Text summary stored on the attempt record and shown to roles.
    #[must_use]
    pub fn summary(&self) -> String {
        let status = match (self.timed_out, self.exit_code) {
            (true, _) => "timed out".to_string(),
            (false, Some(INTERRUPTED_EXIT_CODE)) => {
                format!("exit code {INTERRUPTED_EXIT_CODE} (interrupted)")
            }
            (false, Some(code)) => format!("exit code {code}"),
            (false, None) => "terminated by signal".to_string(),
        };
        let mut out = format!("Command finished ({status})");
        if !self.stdout.is_empty() {
            out.push_str("\n--- stdout ---\n");
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            out.push_str("\n--- stderr ---\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run `command` with `sh -c` in `cwd`.
pub async fn run_shell(
    cwd: &Path,
    command: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ShellOutput> {
    debug!(command, "Running shell command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TetradError::tool("execute_shell", format!("failed to spawn: {e}")))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ShellOutput {
            exit_code: output.status.code(),
            stdout: truncate_output(&output.stdout, max_output_bytes),
            stderr: truncate_output(&output.stderr, max_output_bytes),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(TetradError::tool("execute_shell", e.to_string())),
        Err(_) => Ok(ShellOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }),
    }
}

/// Lossy-decode and cap captured output, keeping the tail.
fn truncate_output(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {} bytes truncated ...]\n{}", start, &text[start..])
}
