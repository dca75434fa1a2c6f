//! The bounded set of effectful operations a role may request.
//!
//! Requests arrive as a closed, tagged [`Action`] variant. Adding a new kind
//! of action means adding a variant here, which forces the safety gate and
//! the surface to handle it explicitly.
//!
//! - [`files`] - read, write, insert and search over the workspace
//! - [`shell`] - shell command execution with timeout and output capture
//! - [`surface`] - validation, gate evaluation, snapshots and dispatch

pub mod files;
pub mod shell;
pub mod surface;

pub use surface::{Submission, ToolSurface};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::driver::Role;

/// Policy-level classification of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Read,
    Search,
    #[serde(alias = "insert")]
    Write,
    ExecuteShell,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Read => "read",
            ActionKind::Search => "search",
            ActionKind::Write => "write",
            ActionKind::ExecuteShell => "execute_shell",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(ActionKind::Read),
            "search" => Ok(ActionKind::Search),
            "write" | "insert" => Ok(ActionKind::Write),
            "execute_shell" | "shell" | "exec" => Ok(ActionKind::ExecuteShell),
            other => Err(format!(
                "unknown action kind '{other}' (expected read, search, write or execute_shell)"
            )),
        }
    }
}

/// A requested operation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Read a whole text file.
    Read { path: String },
    /// Literal substring search under a directory (default: the root).
    Search {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Replace a file's content, creating it if needed.
    Write { path: String, content: String },
    /// Insert text before a 1-based line; `len + 1` appends.
    Insert {
        path: String,
        line: usize,
        content: String,
    },
    /// Run a command through `sh -c` in the workspace root.
    ExecuteShell { command: String },
}

impl Action {
    /// Policy classification.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Read { .. } => ActionKind::Read,
            Action::Search { .. } => ActionKind::Search,
            Action::Write { .. } | Action::Insert { .. } => ActionKind::Write,
            Action::ExecuteShell { .. } => ActionKind::ExecuteShell,
        }
    }

    /// The path this action targets, if it targets one.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Action::Read { path } | Action::Write { path, .. } | Action::Insert { path, .. } => {
                Some(path)
            }
            Action::Search { path, .. } => Some(path.as_deref().unwrap_or(".")),
            Action::ExecuteShell { .. } => None,
        }
    }

    /// The shell command, for shell actions.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match self {
            Action::ExecuteShell { command } => Some(command),
            _ => None,
        }
    }

    /// Whether the action mutates the filesystem through the snapshot store.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Action::Write { .. } | Action::Insert { .. })
    }

    /// One-line description for prompts and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Action::Read { path } => format!("read {path}"),
            Action::Search { query, path } => {
                format!("search {:?} in {}", query, path.as_deref().unwrap_or("."))
            }
            Action::Write { path, content } => {
                format!("write {} ({} bytes)", path, content.len())
            }
            Action::Insert {
                path,
                line,
                content,
            } => format!(
                "insert {} lines into {} at line {}",
                content.lines().count().max(1),
                path,
                line
            ),
            Action::ExecuteShell { command } => format!("run `{command}`"),
        }
    }
}

/// An action together with the role that asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub role: Role,
    #[serde(flatten)]
    pub action: Action,
}

impl ActionRequest {
    #[must_use]
    pub fn new(role: Role, action: Action) -> Self {
        Self { role, action }
    }
}

/// Who let an action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovedBy {
    Policy,
    Human,
}

/// What became of a requested action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Ran to completion.
    Executed { approved_by: ApprovedBy, output: String },
    /// Approved but failed while running.
    Failed { approved_by: ApprovedBy, error: String },
    /// Did not pass shape validation; never reached the gate.
    Rejected { error: String },
    /// Stopped by a hard-block rule.
    Blocked { rule: String },
    /// Refused by a human.
    Denied { reason: String },
}

impl ActionStatus {
    /// Whether this status makes the requesting role's turn a policy denial.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, ActionStatus::Blocked { .. } | ActionStatus::Denied { .. })
    }

    /// Short label for status output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Executed { .. } => "executed",
            ActionStatus::Failed { .. } => "failed",
            ActionStatus::Rejected { .. } => "rejected",
            ActionStatus::Blocked { .. } => "blocked",
            ActionStatus::Denied { .. } => "denied",
        }
    }
}

/// An action and its fate, as kept on the attempt record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    #[serde(flatten)]
    pub status: ActionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_write_kind() {
        let action = Action::Insert {
            path: "a.rs".into(),
            line: 1,
            content: "x".into(),
        };
        assert_eq!(action.kind(), ActionKind::Write);
        assert!(action.is_write());
    }

    #[test]
    fn test_action_wire_shape() {
        let action: Action = serde_json::from_str(
            r#"{"action": "execute_shell", "command": "cargo test"}"#,
        )
        .unwrap();
        assert_eq!(action.command(), Some("cargo test"));
        assert_eq!(action.path(), None);

        let search: Action =
            serde_json::from_str(r#"{"action": "search", "query": "fn main"}"#).unwrap();
        assert_eq!(search.path(), Some("."));
    }

    #[test]
    fn test_unknown_action_is_rejected_by_serde() {
        let result: Result<Action, _> =
            serde_json::from_str(r#"{"action": "delete", "path": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("write".parse::<ActionKind>(), Ok(ActionKind::Write));
        assert_eq!("shell".parse::<ActionKind>(), Ok(ActionKind::ExecuteShell));
        assert!("launch".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_record_flattens_status() {
        let record = ActionRecord {
            action: Action::Read { path: "a".into() },
            status: ActionStatus::Blocked {
                rule: "builtin".into(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "blocked");
        assert_eq!(json["action"]["action"], "read");

        let back: ActionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_denial_statuses() {
        assert!(ActionStatus::Denied { reason: "no".into() }.is_denial());
        assert!(!ActionStatus::Rejected { error: "bad".into() }.is_denial());
    }
}
