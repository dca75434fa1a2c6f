//! Task status and the transitions between statuses.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::driver::Role;

/// Where a task is in the implement → review → test loop.
///
/// # State Transitions
///
/// - `Pending` -> `Active`: task selected as current
/// - `Active` -> `InReview`: implementer reports completion
/// - `Active` -> `Active`: implementer reports failure (rework)
/// - `InReview` -> `Active`: reviewer reports defects
/// - `InReview` -> `Testing`: reviewer approves
/// - `Testing` -> `Active`: tester reports failure
/// - `Testing` -> `Done`: tester approves
/// - any non-final -> `Escalated`: a limit was hit
/// - `Escalated` -> `Active` | `Done`: human resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Active,
    InReview,
    Testing,
    Done,
    Escalated,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::InReview => "in_review",
            TaskStatus::Testing => "testing",
            TaskStatus::Done => "done",
            TaskStatus::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::InReview,
        TaskStatus::Testing,
        TaskStatus::Done,
        TaskStatus::Escalated,
    ];

    /// Check if this status can transition to the target status.
    ///
    /// # Example
    ///
    /// ```
    /// use tetrad::task::TaskStatus;
    ///
    /// assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Active));
    /// assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Active));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Active)
                | (Active, InReview)
                | (Active, Active)
                | (InReview, Active)
                | (InReview, Testing)
                | (Testing, Active)
                | (Testing, Done)
                | (Pending | Active | InReview | Testing, Escalated)
                | (Escalated, Active)
                | (Escalated, Done)
        )
    }

    /// The role whose turn it is in this status, if any.
    #[must_use]
    pub fn acting_role(&self) -> Option<Role> {
        match self {
            TaskStatus::Active => Some(Role::Implementer),
            TaskStatus::InReview => Some(Role::Reviewer),
            TaskStatus::Testing => Some(Role::Tester),
            TaskStatus::Pending | TaskStatus::Done | TaskStatus::Escalated => None,
        }
    }

    /// Status reached when the acting role approves.
    #[must_use]
    pub fn on_approve(&self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Active => Some(TaskStatus::InReview),
            TaskStatus::InReview => Some(TaskStatus::Testing),
            TaskStatus::Testing => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_names() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::InReview,
            TaskStatus::Testing,
            TaskStatus::Done,
            TaskStatus::Escalated,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn test_forward_path() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::InReview));
        assert!(TaskStatus::InReview.can_transition_to(TaskStatus::Testing));
        assert!(TaskStatus::Testing.can_transition_to(TaskStatus::Done));
    }

    #[test]
    fn test_no_skipping_review() {
        assert!(!TaskStatus::Active.can_transition_to(TaskStatus::Testing));
        assert!(!TaskStatus::Active.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::InReview));
    }

    #[test]
    fn test_done_is_final() {
        for target in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::Escalated,
        ] {
            assert!(!TaskStatus::Done.can_transition_to(target));
        }
    }

    #[test]
    fn test_escalation_reachable_and_clearable() {
        assert!(TaskStatus::Testing.can_transition_to(TaskStatus::Escalated));
        assert!(TaskStatus::Escalated.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Escalated.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Escalated.can_transition_to(TaskStatus::Testing));
    }

    #[test]
    fn test_acting_roles() {
        assert_eq!(TaskStatus::Active.acting_role(), Some(Role::Implementer));
        assert_eq!(TaskStatus::InReview.acting_role(), Some(Role::Reviewer));
        assert_eq!(TaskStatus::Testing.acting_role(), Some(Role::Tester));
        assert_eq!(TaskStatus::Escalated.acting_role(), None);
    }

    #[test]
    fn test_on_approve_chain() {
        assert_eq!(TaskStatus::Active.on_approve(), Some(TaskStatus::InReview));
        assert_eq!(TaskStatus::Testing.on_approve(), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::Done.on_approve(), None);
    }
}
