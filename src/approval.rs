//! Human approval of `require_confirmation` actions.
//!
//! When the gate asks for confirmation the scheduler consults an
//! [`Approver`]. An interactive approver asks on the terminal; a deferred
//! approver never answers. Either way, an action without an explicit answer
//! is never run and never silently denied: the turn is parked as a
//! [`PendingApproval`] in the session, identified by a token, and the run
//! stops until `tetrad approve <token>` or `tetrad deny <token>` resolves it.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::driver::{OutcomeTag, Role};
use crate::policy::Verdict;
use crate::tools::{Action, ActionRecord, ActionRequest};

/// Answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: String },
    /// No answer now; park the turn.
    Defer,
}

impl ApprovalDecision {
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

/// Source of approval decisions.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, task_id: &str, request: &ActionRequest, verdict: &Verdict)
        -> ApprovalDecision;
}

/// Never answers; every confirmation becomes a pending approval.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredApprover;

#[async_trait]
impl Approver for DeferredApprover {
    async fn decide(&self, _: &str, _: &ActionRequest, _: &Verdict) -> ApprovalDecision {
        ApprovalDecision::Defer
    }
}

/// Asks on the terminal. Anything other than yes or no defers.
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractiveApprover;

impl InteractiveApprover {
    fn interpret(answer: Option<&str>) -> ApprovalDecision {
        match answer.map(|a| a.trim().to_ascii_lowercase()).as_deref() {
            Some("y" | "yes") => ApprovalDecision::Approve,
            Some("n" | "no") => ApprovalDecision::deny("denied by operator"),
            _ => ApprovalDecision::Defer,
        }
    }
}

#[async_trait]
impl Approver for InteractiveApprover {
    async fn decide(
        &self,
        task_id: &str,
        request: &ActionRequest,
        verdict: &Verdict,
    ) -> ApprovalDecision {
        let prompt = format!(
            "{} {} wants to {} ({})\n  rule: {}\n  approve? [y]es / [n]o / anything else to defer: ",
            "?".yellow().bold(),
            format!("{task_id}/{}", request.role).bold(),
            request.action.describe(),
            request.action.kind(),
            verdict.rule
        );

        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })
        .await;

        match answer {
            Ok(answer) => Self::interpret(answer.as_deref()),
            Err(e) => {
                warn!("Approval prompt failed: {e}");
                ApprovalDecision::Defer
            }
        }
    }
}

/// A turn parked on a human decision.
///
/// Holds everything needed to finish the turn later: the action awaiting
/// the decision, the results of the actions that ran before it, the actions
/// still queued behind it and the outcome the role reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub token: String,
    pub task_id: String,
    pub role: Role,
    pub action: Action,
    /// Rule that asked for confirmation.
    pub rule: String,
    pub outcome: OutcomeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
    #[serde(default)]
    pub completed: Vec<ActionRecord>,
    #[serde(default)]
    pub remaining: Vec<Action>,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    #[must_use]
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// One-line description for status output.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} ({}) asks to {} [rule: {}]",
            self.task_id,
            self.role,
            self.action.describe(),
            self.rule
        )
    }
}
