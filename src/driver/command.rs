//! Driver backed by an external command.
//!
//! The command runs through `sh -c` in the workspace root. It receives the
//! [`DriverRequest`] as a single JSON document on stdin and must print its
//! response as JSON on stdout; anything on stderr is only logged. The role
//! and task id are also exported as `TETRAD_ROLE` and `TETRAD_TASK_ID` so
//! wrapper scripts can pick a prompt without parsing the request.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{parse_response, DriverRequest, DriverResponse, RoleDriver};
use crate::error::{Result, TetradError};

/// Characters of stderr kept in error messages.
const STDERR_TAIL_CHARS: usize = 2000;

/// Runs a shell command per turn.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    command: String,
    cwd: PathBuf,
}

impl CommandDriver {
    #[must_use]
    pub fn new(command: impl Into<String>, cwd: &Path) -> Self {
        let driver = Self {
            command: command.into(),
            cwd: cwd.to_path_buf(),
        };
        if let Some(program) = driver.program() {
            if which::which(program).is_err() && !Path::new(program).exists() {
                warn!("Driver program '{program}' was not found on PATH");
            }
        }
        driver
    }

    /// The configured command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// First word of the command line.
    fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }
}

#[async_trait]
impl RoleDriver for CommandDriver {
    async fn invoke(&self, request: DriverRequest) -> Result<DriverResponse> {
        let role = request.role;
        let payload = serde_json::to_vec(&request)?;
        let task_id = request.task.as_ref().map(|t| t.id.as_str()).unwrap_or("");

        debug!(%role, task_id, command = %self.command, "Invoking driver command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .env("TETRAD_ROLE", role.to_string())
            .env("TETRAD_TASK_ID", task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TetradError::driver(role, format!("failed to spawn: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A driver may exit without reading its input.
            match stdin.write_all(&payload).await {
                Ok(()) => {
                    let _ = stdin.flush().await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(TetradError::driver(role, format!("stdin: {e}"))),
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TetradError::driver(role, e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(%role, "Driver stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let tail: String = {
                let chars: Vec<char> = stderr.trim().chars().collect();
                let start = chars.len().saturating_sub(STDERR_TAIL_CHARS);
                chars[start..].iter().collect()
            };
            return Err(TetradError::driver(
                role,
                format!(
                    "exited with {}{}",
                    output
                        .status
                        .code()
                        .map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
                    if tail.is_empty() {
                        String::new()
                    } else {
                        format!(": {tail}")
                    }
                ),
            ));
        }

        parse_response(role, &String::from_utf8_lossy(&output.stdout))
    }
}
