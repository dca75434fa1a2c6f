//! Bounded context payloads for role turns.
//!
//! A role sees the task header, then as many of the most recent attempts as
//! fit in the character budget, rendered oldest first. The planner instead
//! sees a listing of the workspace files.

use std::fmt::Write as _;
use std::path::Path;

use ignore::WalkBuilder;

use crate::driver::Role;
use crate::task::{AttemptRecord, Task};
use crate::tools::ActionStatus;
use crate::workspace::{Workspace, CONTROL_DIR};

/// Characters kept from a single action result or note.
const ITEM_MAX_CHARS: usize = 800;

/// Room kept for the attempts heading and the omitted-count line.
const SECTION_HEADER_RESERVE: usize = 64;

/// Files listed in the planner context.
const MAX_LISTED_FILES: usize = 200;

/// Builder for the context string handed to a driver.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    max_chars: usize,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Context for `role` acting on `task`.
    #[must_use]
    pub fn for_task(&self, task: &Task, role: Role, max_iterations: u32) -> String {
        let mut header = String::new();
        let _ = writeln!(header, "# Task {}: {}", task.id, task.description);
        let _ = writeln!(
            header,
            "status: {} | iteration: {}/{} | your role: {}",
            task.status, task.iteration, max_iterations, role
        );
        if let Some(reason) = &task.escalation {
            let _ = writeln!(header, "escalation: {reason}");
        }

        let mut remaining = self
            .max_chars
            .saturating_sub(header.chars().count() + SECTION_HEADER_RESERVE);
        let mut sections = Vec::new();
        for attempt in task.attempts.iter().rev() {
            let section = render_attempt(attempt);
            let len = section.chars().count();
            if len > remaining {
                break;
            }
            remaining -= len;
            sections.push(section);
        }

        if !sections.is_empty() {
            let omitted = task.attempts.len() - sections.len();
            header.push_str("\n## Previous attempts\n");
            if omitted > 0 {
                let _ = writeln!(header, "({omitted} older attempts omitted)");
            }
        }
        sections.reverse();
        for section in sections {
            header.push_str(&section);
        }
        truncate_chars(&header, self.max_chars)
    }

    /// Context for the planner turn: the goal and the files present.
    #[must_use]
    pub fn for_plan(&self, goal: &str, workspace: &Workspace) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Goal\n{goal}\n");
        let files = list_files(workspace.root());
        if files.is_empty() {
            out.push_str("The workspace is empty.\n");
        } else {
            out.push_str("# Workspace files\n");
            for file in &files {
                let _ = writeln!(out, "- {file}");
            }
        }
        truncate_chars(&out, self.max_chars)
    }
}

fn render_attempt(attempt: &AttemptRecord) -> String {
    let mut out = String::new();
    let role = attempt
        .role
        .map_or_else(|| "human".to_string(), |r| r.to_string());
    let _ = writeln!(
        out,
        "### #{} {} -> {} ({}, {} -> {})",
        attempt.sequence,
        role,
        attempt.outcome.label(),
        attempt.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        attempt.status_before,
        attempt.status_after
    );
    if let Some(notes) = &attempt.notes {
        let rendered = match notes {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "notes: {}", truncate_chars(&rendered, ITEM_MAX_CHARS));
    }
    for record in &attempt.actions {
        let detail = match &record.status {
            ActionStatus::Executed { output, .. } => output.clone(),
            ActionStatus::Failed { error, .. } | ActionStatus::Rejected { error } => error.clone(),
            ActionStatus::Blocked { rule } => format!("rule: {rule}"),
            ActionStatus::Denied { reason } => reason.clone(),
        };
        let _ = writeln!(
            out,
            "- {} [{}]: {}",
            record.action.describe(),
            record.status.label(),
            truncate_chars(detail.trim(), ITEM_MAX_CHARS)
        );
    }
    out
}

fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkBuilder::new(root)
        .hidden(false)
        .filter_entry(|e| e.file_name() != CONTROL_DIR && e.file_name() != ".git")
        .build()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files.truncate(MAX_LISTED_FILES);
    files
}

/// Keep at most `max` characters, marking the cut.
fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
