//! Mediation of every action a role requests.
//!
//! ```text
//! ActionRequest
//!    │  shape validation (path inside the root, line in range, ...)
//!    ├──────────────► Rejected
//!    ▼
//! SafetyGate::evaluate (on the normalized, workspace-relative action)
//!    ├─ hard_block ──────────► Blocked
//!    ├─ require_confirmation ► NeedsApproval (caller asks a human)
//!    ▼ auto_approve
//! execute: writes capture a snapshot first; reads and searches do not
//! ```

use std::time::Duration;

use tracing::{debug, info};

use super::files::{self, MAX_SEARCH_HITS};
use super::shell::run_shell;
use super::{Action, ActionRecord, ActionRequest, ActionStatus, ApprovedBy};
use crate::config::ShellConfig;
use crate::error::{Result, TetradError};
use crate::policy::{Disposition, SafetyGate, Verdict};
use crate::snapshot::SnapshotStore;
use crate::workspace::{ResolvedPath, Workspace};

/// Result of submitting a request to the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The request reached a final status without human input.
    Done(ActionRecord),
    /// The gate wants a human decision before the action runs.
    NeedsApproval { action: Action, verdict: Verdict },
}

/// The bounded, policed tool set.
#[derive(Debug, Clone)]
pub struct ToolSurface {
    workspace: Workspace,
    gate: SafetyGate,
    snapshots: SnapshotStore,
    shell: ShellConfig,
}

impl ToolSurface {
    #[must_use]
    pub fn new(workspace: Workspace, gate: SafetyGate, shell: ShellConfig) -> Self {
        let snapshots = SnapshotStore::new(&workspace);
        Self {
            workspace,
            gate,
            snapshots,
            shell,
        }
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    #[must_use]
    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Validate, gate and (when policy allows) execute a request.
    pub async fn submit(&self, task_id: &str, request: &ActionRequest) -> Submission {
        let normalized = match self.normalize(&request.action) {
            Ok(action) => action,
            Err(e) => {
                debug!(task_id, role = %request.role, "Rejected action: {e}");
                return Submission::Done(ActionRecord {
                    action: request.action.clone(),
                    status: ActionStatus::Rejected {
                        error: e.to_string(),
                    },
                });
            }
        };

        let verdict = self.gate.evaluate(&normalized);
        info!(
            task_id,
            role = %request.role,
            action = %normalized.describe(),
            disposition = %verdict.disposition,
            rule = %verdict.rule,
            "Gate decision"
        );

        match verdict.disposition {
            Disposition::HardBlock => Submission::Done(ActionRecord {
                action: request.action.clone(),
                status: ActionStatus::Blocked { rule: verdict.rule },
            }),
            Disposition::RequireConfirmation => Submission::NeedsApproval {
                action: request.action.clone(),
                verdict,
            },
            Disposition::AutoApprove => Submission::Done(
                self.execute(task_id, &request.action, ApprovedBy::Policy)
                    .await,
            ),
        }
    }

    /// Run an action that has already been approved.
    ///
    /// Validation is repeated because the workspace may have changed while
    /// a human was deciding.
    pub async fn execute(&self, task_id: &str, action: &Action, approved_by: ApprovedBy) -> ActionRecord {
        let status = match self.run(task_id, action).await {
            Ok(output) => ActionStatus::Executed {
                approved_by,
                output,
            },
            Err(e @ (TetradError::OutsideWorkspace { .. } | TetradError::LineOutOfRange { .. })) => {
                ActionStatus::Rejected {
                    error: e.to_string(),
                }
            }
            Err(e) => ActionStatus::Failed {
                approved_by,
                error: e.to_string(),
            },
        };
        ActionRecord {
            action: action.clone(),
            status,
        }
    }

    /// Check an action's shape and rewrite its paths relative to the root.
    pub fn normalize(&self, action: &Action) -> Result<Action> {
        Ok(match action {
            Action::Read { path } => Action::Read {
                path: self.resolve_file(path, false)?.display_relative(),
            },
            Action::Search { query, path } => {
                if query.is_empty() {
                    return Err(TetradError::tool("search", "query must not be empty"));
                }
                let base = self.workspace.resolve(path.as_deref().unwrap_or("."))?;
                Action::Search {
                    query: query.clone(),
                    path: Some(base.display_relative()),
                }
            }
            Action::Write { path, content } => Action::Write {
                path: self.resolve_file(path, true)?.display_relative(),
                content: content.clone(),
            },
            Action::Insert {
                path,
                line,
                content,
            } => {
                let resolved = self.resolve_file(path, true)?;
                let current = current_text(&resolved)?;
                let display = resolved.display_relative();
                files::insert_lines(&current, *line, content, &display)?;
                Action::Insert {
                    path: display,
                    line: *line,
                    content: content.clone(),
                }
            }
            Action::ExecuteShell { command } => {
                if command.trim().is_empty() {
                    return Err(TetradError::tool("execute_shell", "command must not be empty"));
                }
                action.clone()
            }
        })
    }

    fn resolve_file(&self, raw: &str, for_write: bool) -> Result<ResolvedPath> {
        let resolved = self.workspace.resolve(raw)?;
        if resolved.absolute.is_dir() {
            let tool = if for_write { "write" } else { "read" };
            return Err(TetradError::tool(
                tool,
                format!("{} is a directory", resolved.display_relative()),
            ));
        }
        Ok(resolved)
    }

    async fn run(&self, task_id: &str, action: &Action) -> Result<String> {
        match action {
            Action::Read { path } => {
                let resolved = self.resolve_file(path, false)?;
                let text = files::read_text(&resolved.absolute)?;
                Ok(cap_head(text, self.shell.max_output_bytes))
            }
            Action::Search { query, path } => {
                let base = self.workspace.resolve(path.as_deref().unwrap_or("."))?;
                let hits = files::search(self.workspace.root(), &base.absolute, query, MAX_SEARCH_HITS)?;
                Ok(files::format_hits(&hits))
            }
            Action::Write { path, content } => {
                let resolved = self.resolve_file(path, true)?;
                self.write_with_snapshot(task_id, &resolved, content.as_bytes())?;
                Ok(format!(
                    "Wrote {} bytes to {}",
                    content.len(),
                    resolved.display_relative()
                ))
            }
            Action::Insert {
                path,
                line,
                content,
            } => {
                let resolved = self.resolve_file(path, true)?;
                let display = resolved.display_relative();
                let updated = files::insert_lines(&current_text(&resolved)?, *line, content, &display)?;
                self.write_with_snapshot(task_id, &resolved, updated.as_bytes())?;
                Ok(format!("Inserted at line {line} of {display}"))
            }
            Action::ExecuteShell { command } => {
                let output = run_shell(
                    self.workspace.root(),
                    command,
                    Duration::from_secs(self.shell.timeout_secs),
                    self.shell.max_output_bytes,
                )
                .await?;
                Ok(output.summary())
            }
        }
    }

    fn write_with_snapshot(&self, task_id: &str, target: &ResolvedPath, bytes: &[u8]) -> Result<()> {
        self.snapshots.capture(task_id, target)?;
        files::write_atomic(&target.absolute, bytes)
    }
}

/// Current content of the file an insert targets, which must exist.
fn current_text(target: &ResolvedPath) -> Result<String> {
    if !target.absolute.is_file() {
        return Err(TetradError::tool(
            "insert",
            format!("{} does not exist", target.display_relative()),
        ));
    }
    files::read_text(&target.absolute)
}

fn cap_head(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... {} bytes truncated ...]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Role;
    use crate::policy::PolicyRule;
    use crate::tools::ActionKind;
    use std::fs;
    use tempfile::TempDir;

    fn surface(rules: &[PolicyRule]) -> (ToolSurface, TempDir) {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let gate = SafetyGate::new(rules).unwrap();
        (ToolSurface::new(ws, gate, ShellConfig::default()), temp)
    }

    fn permissive() -> Vec<PolicyRule> {
        vec![
            PolicyRule::for_kind(ActionKind::Write, Disposition::AutoApprove),
            PolicyRule::for_kind(ActionKind::ExecuteShell, Disposition::AutoApprove),
        ]
    }

    fn request(action: Action) -> ActionRequest {
        ActionRequest::new(Role::Implementer, action)
    }

    fn done(submission: Submission) -> ActionRecord {
        match submission {
            Submission::Done(record) => record,
            Submission::NeedsApproval { .. } => panic!("unexpected approval request"),
        }
    }

    #[tokio::test]
    async fn test_outside_write_rejected_before_snapshot() {
        let (surface, _temp) = surface(&permissive());
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Write {
                        path: "../escape.txt".into(),
                        content: "x".into(),
                    }),
                )
                .await,
        );
        assert!(matches!(record.status, ActionStatus::Rejected { .. }));
        assert!(surface.snapshots().snapshots_for("task-1").unwrap().is_empty());
        assert!(!surface.snapshots().dir().join("index.json").exists());
    }

    #[tokio::test]
    async fn test_auto_approved_write_is_snapshotted() {
        let (surface, temp) = surface(&permissive());
        fs::write(temp.path().join("a.txt"), "old").unwrap();

        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Write {
                        path: "a.txt".into(),
                        content: "new".into(),
                    }),
                )
                .await,
        );
        assert!(matches!(
            record.status,
            ActionStatus::Executed {
                approved_by: ApprovedBy::Policy,
                ..
            }
        ));
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).unwrap(), "new");
        assert_eq!(surface.snapshots().snapshots_for("task-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_write_needs_approval_and_runs_after_it() {
        let (surface, temp) = surface(&[]);
        let action = Action::Write {
            path: "b.txt".into(),
            content: "hello".into(),
        };
        let submission = surface.submit("task-1", &request(action.clone())).await;
        let Submission::NeedsApproval { verdict, .. } = submission else {
            panic!("expected approval request");
        };
        assert_eq!(verdict.disposition, Disposition::RequireConfirmation);
        assert!(!temp.path().join("b.txt").exists());

        let record = surface.execute("task-1", &action, ApprovedBy::Human).await;
        assert!(matches!(
            record.status,
            ActionStatus::Executed {
                approved_by: ApprovedBy::Human,
                ..
            }
        ));
        assert_eq!(fs::read_to_string(temp.path().join("b.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_control_dir_write_blocked() {
        let (surface, temp) = surface(&permissive());
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Write {
                        path: "./.tetrad/session.json".into(),
                        content: "{}".into(),
                    }),
                )
                .await,
        );
        assert!(matches!(record.status, ActionStatus::Blocked { .. }));
        assert!(record.status.is_denial());
        assert!(!temp.path().join(".tetrad/session.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_link_to_control_dir_blocked() {
        let (surface, temp) = surface(&permissive());
        let control = temp.path().join(".tetrad");
        fs::create_dir_all(&control).unwrap();
        fs::write(control.join("session.json"), "{}").unwrap();
        std::os::unix::fs::symlink(&control, temp.path().join("ctl")).unwrap();

        for action in [
            Action::Write {
                path: "ctl/session.json".into(),
                content: "clobbered".into(),
            },
            Action::Insert {
                path: "ctl/session.json".into(),
                line: 1,
                content: "clobbered".into(),
            },
        ] {
            let record = done(surface.submit("task-1", &request(action)).await);
            match record.status {
                ActionStatus::Blocked { rule } => assert!(rule.starts_with("builtin:")),
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(fs::read_to_string(control.join("session.json")).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_read_bypasses_snapshots() {
        let (surface, temp) = surface(&[]);
        fs::write(temp.path().join("r.txt"), "content").unwrap();
        let record = done(
            surface
                .submit("task-1", &request(Action::Read { path: "r.txt".into() }))
                .await,
        );
        match record.status {
            ActionStatus::Executed { output, .. } => assert_eq!(output, "content"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(!surface.snapshots().dir().exists());
    }

    #[tokio::test]
    async fn test_insert_out_of_range_is_rejected() {
        let (surface, temp) = surface(&permissive());
        fs::write(temp.path().join("f.txt"), "a\nb\n").unwrap();
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Insert {
                        path: "f.txt".into(),
                        line: 9,
                        content: "x".into(),
                    }),
                )
                .await,
        );
        match record.status {
            ActionStatus::Rejected { error } => assert!(error.contains("out of range")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(fs::read_to_string(temp.path().join("f.txt")).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn test_insert_into_missing_file_is_rejected() {
        let (surface, temp) = surface(&permissive());
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Insert {
                        path: "missing.txt".into(),
                        line: 1,
                        content: "x".into(),
                    }),
                )
                .await,
        );
        match record.status {
            ActionStatus::Rejected { error } => assert!(error.contains("does not exist")),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(!temp.path().join("missing.txt").exists());
        assert!(surface.snapshots().snapshots_for("task-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_applies() {
        let (surface, temp) = surface(&permissive());
        fs::write(temp.path().join("f.txt"), "a\nc\n").unwrap();
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Insert {
                        path: "f.txt".into(),
                        line: 2,
                        content: "b".into(),
                    }),
                )
                .await,
        );
        assert!(matches!(record.status, ActionStatus::Executed { .. }));
        assert_eq!(fs::read_to_string(temp.path().join("f.txt")).unwrap(), "a\nb\nc\n");
    }

    #[tokio::test]
    async fn test_shell_blocked_and_allowed() {
        let (surface, _temp) = surface(&permissive());
        let blocked = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::ExecuteShell {
                        command: "rm -rf /".into(),
                    }),
                )
                .await,
        );
        assert!(matches!(blocked.status, ActionStatus::Blocked { .. }));

        let ran = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::ExecuteShell {
                        command: "echo hi".into(),
                    }),
                )
                .await,
        );
        match ran.status {
            ActionStatus::Executed { output, .. } => assert!(output.contains("hi")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_search_is_auto_approved() {
        let (surface, temp) = surface(&[]);
        fs::write(temp.path().join("s.rs"), "fn needle() {}\n").unwrap();
        let record = done(
            surface
                .submit(
                    "task-1",
                    &request(Action::Search {
                        query: "needle".into(),
                        path: None,
                    }),
                )
                .await,
        );
        match record.status {
            ActionStatus::Executed { output, .. } => assert!(output.starts_with("s.rs:1:")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_cap_head() {
        let capped = cap_head("abcdef".to_string(), 3);
        assert!(capped.starts_with("abc\n"));
        assert!(capped.contains("3 bytes truncated"));
    }
}
