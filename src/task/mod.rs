//! Task records and their attempt history.
//!
//! A [`Task`] is one unit of the work breakdown. Tasks are never removed;
//! every turn taken against a task is appended to its attempt history so an
//! escalated task can be handed to a human with the full story.

pub mod plan;
pub mod state;

pub use plan::parse_plan;
pub use state::TaskStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::driver::Role;
use crate::tools::ActionRecord;

/// Why a task stopped taking automatic turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Another rework loop would exceed the ceiling.
    IterationCeiling { ceiling: u32 },
    /// The driver kept returning unusable responses.
    TransientRetriesExhausted { retries: u32 },
    /// Every recent turn had an action denied.
    RepeatedDenials { denials: u32 },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::IterationCeiling { ceiling } => {
                write!(f, "iteration ceiling of {ceiling} reached")
            }
            EscalationReason::TransientRetriesExhausted { retries } => {
                write!(f, "driver response unusable after {retries} retries")
            }
            EscalationReason::RepeatedDenials { denials } => {
                write!(f, "{denials} consecutive turns had actions denied")
            }
        }
    }
}

/// How a human cleared an escalated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Reset the iteration count and hand the task back to the implementer.
    Retry,
    /// Accept the task as finished outside the loop.
    MarkDone,
}

/// What a single turn amounted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Approved,
    /// Substantive rejection; consumes an iteration.
    Rejected,
    /// The driver missed its deadline; consumes an iteration.
    TimedOut { after_secs: u64 },
    /// Malformed or missing response; does not consume an iteration.
    Transient { error: String },
    /// An action was blocked or denied; does not consume an iteration.
    PolicyDenied { reason: String },
    /// A human cleared an escalation.
    Resolved { resolution: Resolution },
}

impl AttemptOutcome {
    /// Short label for status output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Approved => "approved",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::TimedOut { .. } => "timed out",
            AttemptOutcome::Transient { .. } => "transient failure",
            AttemptOutcome::PolicyDenied { .. } => "policy denied",
            AttemptOutcome::Resolved { .. } => "resolved",
        }
    }
}

/// One entry in a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based position in the task's history.
    pub sequence: u32,
    /// Acting role; `None` for human resolutions.
    pub role: Option<Role>,
    pub recorded_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
    pub status_before: TaskStatus,
    pub status_after: TaskStatus,
    pub iteration_after: u32,
}

/// A unit of work in the session's breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Rework loops consumed so far.
    pub iteration: u32,
    /// Consecutive transient failures of the current role.
    #[serde(default)]
    pub transient_failures: u32,
    /// Consecutive turns that ended in a policy denial.
    #[serde(default)]
    pub consecutive_denials: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationReason>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl Task {
    /// Create a pending task at the given position of the breakdown.
    #[must_use]
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(index),
            description: description.into(),
            status: TaskStatus::Pending,
            iteration: 0,
            transient_failures: 0,
            consecutive_denials: 0,
            escalation: None,
            attempts: Vec::new(),
        }
    }

    /// Stable id for the task at a 0-based position.
    #[must_use]
    pub fn id_for(index: usize) -> String {
        format!("task-{}", index + 1)
    }

    /// Accept `3`, `task-3` or `TASK-3` as a reference to `task-3`.
    #[must_use]
    pub fn normalize_id(raw: &str) -> String {
        let trimmed = raw.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            format!("task-{trimmed}")
        } else {
            trimmed.to_ascii_lowercase()
        }
    }

    /// The most recent attempts, oldest first.
    #[must_use]
    pub fn recent_attempts(&self, count: usize) -> &[AttemptRecord] {
        let start = self.attempts.len().saturating_sub(count);
        &self.attempts[start..]
    }

    /// Next attempt sequence number.
    #[must_use]
    pub fn next_sequence(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }
}
