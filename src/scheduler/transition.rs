//! Pure task transitions.
//!
//! Everything here is a function of (task, outcome, limits). The scheduler
//! wraps these with persistence and auditing; tests exercise them directly.
//!
//! Iteration accounting:
//!
//! | Outcome        | Status after                 | Iteration |
//! |----------------|------------------------------|-----------|
//! | approve        | next stage                   | unchanged |
//! | reject         | `active` (or `escalated`)    | +1        |
//! | reject, active | unchanged (or `escalated`)   | unchanged |
//! | timed out      | `active` (or `escalated`)    | +1        |
//! | transient      | unchanged (or `escalated`)   | unchanged |
//! | policy denied  | unchanged (or `escalated`)   | unchanged |
//!
//! Only the reviewer and tester reject substantively. An implementer that
//! reports `reject` on its own turn has produced nothing to review, so the
//! turn is retried like a transient failure and shares that budget.

use serde::{Deserialize, Serialize};

use crate::driver::Role;
use crate::error::{Result, TetradError};
use crate::session::SessionSettings;
use crate::task::{AttemptOutcome, EscalationReason, Resolution, Task, TaskStatus};

/// Structured outcome of the role that just acted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleOutcome {
    Approve,
    Reject,
    TimedOut { after_secs: u64 },
    Transient { error: String },
    PolicyDenied { reason: String },
}

impl RoleOutcome {
    /// How the outcome is kept on the attempt record.
    #[must_use]
    pub fn to_attempt(&self) -> AttemptOutcome {
        match self {
            RoleOutcome::Approve => AttemptOutcome::Approved,
            RoleOutcome::Reject => AttemptOutcome::Rejected,
            RoleOutcome::TimedOut { after_secs } => AttemptOutcome::TimedOut {
                after_secs: *after_secs,
            },
            RoleOutcome::Transient { error } => AttemptOutcome::Transient {
                error: error.clone(),
            },
            RoleOutcome::PolicyDenied { reason } => AttemptOutcome::PolicyDenied {
                reason: reason.clone(),
            },
        }
    }

    /// Whether this outcome, reported in status `from`, consumes a rework
    /// iteration.
    #[must_use]
    pub fn consumes_iteration(&self, from: TaskStatus) -> bool {
        match self {
            RoleOutcome::Reject => from != TaskStatus::Active,
            RoleOutcome::TimedOut { .. } => true,
            _ => false,
        }
    }
}

/// What a transition did to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub iteration: u32,
    pub escalation: Option<EscalationReason>,
}

/// What the scheduler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Give `role` its turn on `task_id`.
    Invoke { task_id: String, role: Role },
    /// The task needs a human before anything else happens.
    Escalated {
        task_id: String,
        reason: EscalationReason,
    },
    /// Every task is done.
    SessionComplete,
}

/// Apply a role's outcome to a task.
///
/// Fails only when the task is not in a status where a role acts.
pub fn apply(task: &mut Task, outcome: &RoleOutcome, settings: &SessionSettings) -> Result<Transition> {
    let from = task.status;
    if from.acting_role().is_none() {
        return Err(invalid(task, from, "a role turn"));
    }

    let escalation = match outcome {
        RoleOutcome::Approve => {
            let next = from
                .on_approve()
                .ok_or_else(|| invalid(task, from, "approval"))?;
            task.status = next;
            task.transient_failures = 0;
            task.consecutive_denials = 0;
            None
        }
        RoleOutcome::Reject if from == TaskStatus::Active => {
            task.consecutive_denials = 0;
            task.transient_failures += 1;
            (task.transient_failures > settings.transient_retries).then_some(
                EscalationReason::TransientRetriesExhausted {
                    retries: settings.transient_retries,
                },
            )
        }
        RoleOutcome::Reject | RoleOutcome::TimedOut { .. } => {
            task.transient_failures = 0;
            task.consecutive_denials = 0;
            let next_iteration = task.iteration + 1;
            if next_iteration > settings.max_iterations {
                Some(EscalationReason::IterationCeiling {
                    ceiling: settings.max_iterations,
                })
            } else {
                task.iteration = next_iteration;
                task.status = TaskStatus::Active;
                None
            }
        }
        RoleOutcome::Transient { .. } => {
            task.transient_failures += 1;
            (task.transient_failures > settings.transient_retries).then_some(
                EscalationReason::TransientRetriesExhausted {
                    retries: settings.transient_retries,
                },
            )
        }
        RoleOutcome::PolicyDenied { .. } => {
            task.transient_failures = 0;
            task.consecutive_denials += 1;
            (task.consecutive_denials > settings.max_consecutive_denials).then_some(
                EscalationReason::RepeatedDenials {
                    denials: task.consecutive_denials,
                },
            )
        }
    };

    if let Some(reason) = &escalation {
        task.status = TaskStatus::Escalated;
        task.escalation = Some(reason.clone());
    }

    debug_assert!(from.can_transition_to(task.status) || from == task.status);
    Ok(Transition {
        from,
        to: task.status,
        iteration: task.iteration,
        escalation,
    })
}

/// Clear an escalation by human decision.
pub fn resolve(task: &mut Task, resolution: Resolution) -> Result<Transition> {
    let from = task.status;
    if from != TaskStatus::Escalated {
        return Err(invalid(task, from, "resolution"));
    }
    match resolution {
        Resolution::Retry => {
            task.status = TaskStatus::Active;
            task.iteration = 0;
        }
        Resolution::MarkDone => task.status = TaskStatus::Done,
    }
    task.escalation = None;
    task.transient_failures = 0;
    task.consecutive_denials = 0;
    Ok(Transition {
        from,
        to: task.status,
        iteration: task.iteration,
        escalation: None,
    })
}

/// Select a pending task as the current one.
pub fn activate(task: &mut Task) -> Result<Transition> {
    let from = task.status;
    if from != TaskStatus::Pending {
        return Err(invalid(task, from, "activation"));
    }
    task.status = TaskStatus::Active;
    Ok(Transition {
        from,
        to: task.status,
        iteration: task.iteration,
        escalation: None,
    })
}

fn invalid(task: &Task, from: TaskStatus, what: &str) -> TetradError {
    TetradError::InvalidTransition {
        id: task.id.clone(),
        from: from.to_string(),
        to: what.to_string(),
    }
}
