//! Custom assertions over session state.

use crate::session::SessionState;
use crate::task::{AttemptOutcome, TaskStatus};

/// Assert that a task is in the expected status.
///
/// # Panics
///
/// Panics with the task's attempt history if the status differs.
///
/// # Example
///
/// ```rust,ignore
/// assert_task_status(scheduler.state(), "task-1", TaskStatus::Done);
/// ```
pub fn assert_task_status(state: &SessionState, task_id: &str, expected: TaskStatus) {
    let task = state
        .task(task_id)
        .unwrap_or_else(|e| panic!("Expected task {task_id} to exist: {e}"));
    assert_eq!(
        task.status,
        expected,
        "Expected {task_id} to be {expected}, but it is {}.\nAttempts: {:#?}",
        task.status,
        task.attempts
    );
}

/// Assert that a task has consumed exactly `expected` iterations.
///
/// # Panics
///
/// Panics if the iteration count differs.
pub fn assert_iteration(state: &SessionState, task_id: &str, expected: u32) {
    let task = state
        .task(task_id)
        .unwrap_or_else(|e| panic!("Expected task {task_id} to exist: {e}"));
    assert_eq!(
        task.iteration, expected,
        "Expected {task_id} at iteration {expected}, but it is at {}",
        task.iteration
    );
}

/// Assert the sequence of attempt outcome labels recorded for a task.
///
/// # Panics
///
/// Panics if the labels differ.
///
/// # Example
///
/// ```rust,ignore
/// assert_attempt_labels(state, "task-1", &["approved", "rejected", "approved"]);
/// ```
pub fn assert_attempt_labels(state: &SessionState, task_id: &str, expected: &[&str]) {
    let task = state
        .task(task_id)
        .unwrap_or_else(|e| panic!("Expected task {task_id} to exist: {e}"));
    let labels: Vec<&str> = task.attempts.iter().map(|a| a.outcome.label()).collect();
    assert_eq!(labels, expected, "Unexpected attempt history for {task_id}");
}

/// Assert that no attempt on any task consumed an iteration without a
/// substantive rejection or timeout behind it.
///
/// # Panics
///
/// Panics on the first attempt that moved the iteration count unexpectedly.
pub fn assert_iterations_consistent(state: &SessionState) {
    for task in &state.tasks {
        let mut previous = 0;
        for attempt in &task.attempts {
            let counts = match attempt.outcome {
                AttemptOutcome::Rejected => attempt.status_before != TaskStatus::Active,
                AttemptOutcome::TimedOut { .. } => true,
                _ => false,
            };
            let resolved = matches!(attempt.outcome, AttemptOutcome::Resolved { .. });
            let escalated = attempt.status_after == TaskStatus::Escalated;
            let expected = if counts && !escalated {
                previous + 1
            } else if resolved {
                attempt.iteration_after
            } else {
                previous
            };
            assert_eq!(
                attempt.iteration_after, expected,
                "{} attempt #{} ({}) moved the iteration from {previous} to {}",
                task.id,
                attempt.sequence,
                attempt.outcome.label(),
                attempt.iteration_after
            );
            previous = attempt.iteration_after;
        }
    }
}
