//! Turn scheduler.
//!
//! The scheduler owns the [`SessionState`] and is the only thing that
//! mutates it. One task is active at a time and one role acts at a time:
//!
//! ```text
//! loop {
//!   stop requested?         -> persist, Stopped
//!   approval outstanding?   -> AwaitingApproval
//!   task escalated?         -> EscalationPending
//!   next task in list order -> activate (pending -> active), persist
//!   role turn:
//!     driver call (deadline; heartbeat persisted while waiting)
//!     each requested action -> ToolSurface -> gate -> approver
//!     transition::apply -> attempt record -> persist -> audit
//! }
//! ```
//!
//! Every scheduling decision is persisted before the next role is invoked.
//! A persistence failure ends the run immediately; audit failures are only
//! logged.

pub mod context;
pub mod transition;

pub use context::ContextBuilder;
pub use transition::{NextStep, RoleOutcome, Transition};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, Approver, DeferredApprover, PendingApproval};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::ProjectConfig;
use crate::driver::{
    invoke_with_deadline, DriverRequest, DriverResponse, DriverSet, OutcomeTag, Role, RoleDriver,
    TaskBrief, TurnFailure,
};
use crate::error::{Result, TetradError};
use crate::session::{SessionPersistence, SessionState, StopSignal};
use crate::snapshot::UndoReport;
use crate::task::{AttemptOutcome, AttemptRecord, EscalationReason, Resolution, TaskStatus};
use crate::tools::{Action, ActionRecord, ActionRequest, ActionStatus, ApprovedBy, Submission, ToolSurface};
use crate::workspace::Workspace;

/// `interval` panics on a zero period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Timing and sizing knobs that are not part of the persisted session.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub driver_timeout: Duration,
    pub heartbeat: Duration,
    pub context_max_chars: usize,
}

impl SchedulerOptions {
    #[must_use]
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            driver_timeout: Duration::from_secs(config.driver.timeout_secs),
            heartbeat: Duration::from_secs(config.orchestrator.heartbeat_secs),
            context_max_chars: config.orchestrator.context_max_chars,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&ProjectConfig::default())
    }
}

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task is done.
    Complete,
    /// A task hit a limit and needs `tetrad resolve`.
    EscalationPending {
        task_id: String,
        reason: EscalationReason,
    },
    /// An action is waiting for `tetrad approve` or `tetrad deny`.
    AwaitingApproval { token: String, description: String },
    /// A stop signal was honored between turns.
    Stopped,
}

impl RunOutcome {
    /// Process exit status for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Complete => 0,
            RunOutcome::EscalationPending { .. } => 3,
            RunOutcome::AwaitingApproval { .. } => 4,
            RunOutcome::Stopped => 5,
        }
    }
}

/// The orchestration loop over a single session.
pub struct Scheduler {
    state: SessionState,
    persistence: SessionPersistence,
    surface: ToolSurface,
    drivers: DriverSet,
    approver: Arc<dyn Approver>,
    audit: AuditLogger,
    stop: StopSignal,
    options: SchedulerOptions,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("session_id", &self.state.metadata.session_id)
            .field("tasks", &self.state.tasks.len())
            .field("drivers", &self.drivers)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Wrap a session. Drivers default to none and approvals to deferral, so
    /// a scheduler built this way can resolve approvals, escalations and
    /// undo requests but cannot run turns until drivers are supplied.
    #[must_use]
    pub fn new(
        state: SessionState,
        persistence: SessionPersistence,
        surface: ToolSurface,
        audit: AuditLogger,
    ) -> Self {
        Self {
            state,
            persistence,
            surface,
            drivers: DriverSet::new(),
            approver: Arc::new(DeferredApprover),
            audit,
            stop: StopSignal::new(),
            options: SchedulerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_drivers(mut self, drivers: DriverSet) -> Self {
        self.drivers = drivers;
        self
    }

    #[must_use]
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn surface(&self) -> &ToolSurface {
        &self.surface
    }

    /// Persist a freshly created session and record its start.
    pub fn record_start(&mut self) -> Result<()> {
        self.persist()?;
        let data = json!({
            "goal": self.state.goal,
            "tasks": self.state.tasks.len(),
            "settings": self.state.settings,
        });
        self.audit_with(|log, sid| log.log_event(AuditEventType::SessionStart, sid, None, data));
        info!(
            session_id = %self.state.metadata.session_id,
            tasks = self.state.tasks.len(),
            "Session started"
        );
        Ok(())
    }

    /// Record that a persisted session is being picked up again.
    pub fn record_resume(&self) {
        let active = self.state.active_task().map(|t| t.id.clone());
        let data = json!({ "active_task": active, "revision": self.state.metadata.revision });
        self.audit_with(|log, sid| log.log_event(AuditEventType::SessionResume, sid, None, data));
        info!(
            session_id = %self.state.metadata.session_id,
            active_task = ?active,
            "Session resumed"
        );
    }

    /// Run turns until the session completes or something needs a human.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        loop {
            if self.stop.is_requested() {
                info!("Stop requested; halting between turns");
                self.persist()?;
                self.audit_with(|log, sid| {
                    log.log_event(AuditEventType::SessionEnd, sid, None, json!({ "reason": "stopped" }))
                });
                return Ok(RunOutcome::Stopped);
            }

            if let Some(pending) = &self.state.pending_approval {
                return Ok(RunOutcome::AwaitingApproval {
                    token: pending.token.clone(),
                    description: pending.describe(),
                });
            }

            match self.next_step() {
                NextStep::SessionComplete => {
                    info!("All tasks done");
                    self.audit_with(|log, sid| {
                        log.log_event(AuditEventType::SessionEnd, sid, None, json!({ "reason": "complete" }))
                    });
                    return Ok(RunOutcome::Complete);
                }
                NextStep::Escalated { task_id, reason } => {
                    warn!(task_id, "Task escalated: {reason}");
                    return Ok(RunOutcome::EscalationPending { task_id, reason });
                }
                NextStep::Invoke { task_id, .. } => {
                    self.activate(&task_id)?;
                    self.take_turn(&task_id).await?;
                }
            }
        }
    }

    /// What should happen next, judged from the current state alone.
    #[must_use]
    pub fn next_step(&self) -> NextStep {
        if let Some(task) = self.state.escalated_task() {
            let reason = task
                .escalation
                .clone()
                .unwrap_or(EscalationReason::IterationCeiling {
                    ceiling: self.state.settings.max_iterations,
                });
            return NextStep::Escalated {
                task_id: task.id.clone(),
                reason,
            };
        }
        match self.state.next_index().and_then(|i| self.state.tasks.get(i)) {
            None => NextStep::SessionComplete,
            Some(task) => NextStep::Invoke {
                task_id: task.id.clone(),
                role: task.status.acting_role().unwrap_or(Role::Implementer),
            },
        }
    }

    /// Apply the outcome reported by the role acting on `task_id`.
    ///
    /// Records an attempt, persists the session and returns what happens
    /// next. The transition is rejected if no role acts in the task's
    /// current status.
    pub fn advance(
        &mut self,
        task_id: &str,
        outcome: RoleOutcome,
        notes: Option<serde_json::Value>,
    ) -> Result<NextStep> {
        self.finish_turn(task_id, &outcome, notes, Vec::new())
    }

    /// Clear an escalated task.
    pub fn resolve_escalation(&mut self, task_id: &str, resolution: Resolution) -> Result<NextStep> {
        let task = self.state.task_mut(task_id)?;
        let change = transition::resolve(task, resolution)?;
        let sequence = task.next_sequence();
        task.attempts.push(AttemptRecord {
            sequence,
            role: None,
            recorded_at: Utc::now(),
            outcome: AttemptOutcome::Resolved { resolution },
            notes: None,
            actions: Vec::new(),
            status_before: change.from,
            status_after: change.to,
            iteration_after: change.iteration,
        });
        let id = task.id.clone();
        self.persist()?;

        info!(task_id = %id, ?resolution, "Escalation resolved");
        self.audit_with(|log, sid| log.log_escalation_resolved(sid, &id, resolution));
        self.audit_with(|log, sid| {
            log.log_transition(sid, &id, change.from, change.to, "resolved", change.iteration)
        });
        Ok(self.next_step())
    }

    /// Decide the outstanding approval identified by `token`, then finish
    /// the turn it interrupted.
    ///
    /// Approval runs the held action and continues with the actions queued
    /// behind it. Denial records the denial and ends the turn as a policy
    /// denial. Deferral leaves everything as it is.
    pub async fn resolve_approval(&mut self, token: &str, decision: ApprovalDecision) -> Result<NextStep> {
        let pending = match &self.state.pending_approval {
            Some(p) if p.token == token => p.clone(),
            _ => {
                return Err(TetradError::UnknownApproval {
                    token: token.to_string(),
                })
            }
        };
        let task_id = pending.task_id.clone();
        let record = match decision {
            ApprovalDecision::Defer => return Ok(self.next_step()),
            ApprovalDecision::Approve => {
                self.surface
                    .execute(&task_id, &pending.action, ApprovedBy::Human)
                    .await
            }
            ApprovalDecision::Deny { reason } => ActionRecord {
                action: pending.action.clone(),
                status: ActionStatus::Denied { reason },
            },
        };
        self.state.pending_approval = None;

        info!(task_id, token, status = record.status.label(), "Approval resolved");
        let data = json!({
            "token": token,
            "action": pending.action.describe(),
            "status": record.status.label(),
        });
        self.audit_with(|log, sid| {
            log.log_event(AuditEventType::ApprovalResolved, sid, Some(&task_id), data)
        });
        self.audit_with(|log, sid| log.log_action(sid, &task_id, &record));

        let mut completed = pending.completed;
        if record.status.is_denial() {
            let reason = denial_reason(&record);
            completed.push(record);
            return self.finish_turn(
                &task_id,
                &RoleOutcome::PolicyDenied { reason },
                pending.notes,
                completed,
            );
        }
        completed.push(record);
        self.process_actions(
            &task_id,
            pending.role,
            pending.outcome,
            pending.notes,
            completed,
            pending.remaining,
        )
        .await
    }

    /// Restore every file the task wrote to its pre-write content.
    pub fn undo(&mut self, task_id: &str) -> Result<UndoReport> {
        let id = self.state.task(task_id)?.id.clone();
        let report = self.surface.snapshots().undo(&id)?;
        if report.is_empty() {
            info!(task_id = %id, "Nothing to undo");
        } else {
            info!(
                task_id = %id,
                restored = report.restored.len(),
                removed = report.removed.len(),
                "Undo complete"
            );
            let data = json!({ "restored": report.restored, "removed": report.removed });
            self.audit_with(|log, sid| log.log_event(AuditEventType::Undo, sid, Some(&id), data));
        }
        Ok(report)
    }

    fn activate(&mut self, task_id: &str) -> Result<()> {
        let index = self
            .state
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| TetradError::UnknownTask {
                id: task_id.to_string(),
            })?;

        let mut changed = self.state.active_index != Some(index);
        self.state.active_index = Some(index);
        let task = &mut self.state.tasks[index];
        let activation = if task.status == TaskStatus::Pending {
            changed = true;
            Some(transition::activate(task)?)
        } else {
            None
        };

        if changed {
            self.persist()?;
        }
        if let Some(change) = activation {
            info!(task_id, "Task activated");
            self.audit_with(|log, sid| {
                log.log_transition(sid, task_id, change.from, change.to, "activated", change.iteration)
            });
        }
        Ok(())
    }

    async fn take_turn(&mut self, task_id: &str) -> Result<()> {
        let task = self.state.task(task_id)?;
        let role = task.status.acting_role().ok_or_else(|| TetradError::InvalidTransition {
            id: task.id.clone(),
            from: task.status.to_string(),
            to: "a role turn".to_string(),
        })?;
        let max = self.state.settings.max_iterations;
        let request = DriverRequest {
            role,
            goal: self.state.goal.clone(),
            task: Some(TaskBrief::new(task, max)),
            context: ContextBuilder::new(self.options.context_max_chars).for_task(task, role, max),
        };
        info!(task_id, %role, iteration = task.iteration, status = %task.status, "Turn started");

        let driver = self.drivers.for_role(role)?;
        match self.call_driver(driver, request).await? {
            Ok(response) => {
                let DriverResponse {
                    outcome,
                    notes,
                    actions,
                    tasks,
                } = response;
                if !tasks.is_empty() {
                    debug!(task_id, %role, "Ignoring task list from a non-planner turn");
                }
                self.process_actions(task_id, role, outcome, notes, Vec::new(), actions)
                    .await?;
            }
            Err(TurnFailure::Transient(error)) => {
                self.finish_turn(task_id, &RoleOutcome::Transient { error }, None, Vec::new())?;
            }
            Err(TurnFailure::TimedOut { after_secs }) => {
                self.finish_turn(task_id, &RoleOutcome::TimedOut { after_secs }, None, Vec::new())?;
            }
        }
        Ok(())
    }

    /// Wait for the driver, persisting a heartbeat while the call is out.
    async fn call_driver(
        &mut self,
        driver: Arc<dyn RoleDriver>,
        request: DriverRequest,
    ) -> Result<std::result::Result<DriverResponse, TurnFailure>> {
        let call = invoke_with_deadline(driver.as_ref(), request, self.options.driver_timeout);
        tokio::pin!(call);

        let mut heartbeat = tokio::time::interval(self.options.heartbeat.max(MIN_HEARTBEAT));
        heartbeat.tick().await;
        loop {
            tokio::select! {
                result = &mut call => return Ok(result),
                _ = heartbeat.tick() => self.heartbeat()?,
            }
        }
    }

    fn heartbeat(&mut self) -> Result<()> {
        self.state.metadata.heartbeat_at = Some(Utc::now());
        self.persistence.save(&self.state)?;
        debug!("Heartbeat persisted");
        Ok(())
    }

    /// Run the requested actions in order, then close the turn.
    ///
    /// A denied action ends the turn as a policy denial and the actions
    /// behind it are skipped. A deferred approval parks the turn.
    async fn process_actions(
        &mut self,
        task_id: &str,
        role: Role,
        outcome: OutcomeTag,
        notes: Option<serde_json::Value>,
        completed: Vec<ActionRecord>,
        remaining: Vec<Action>,
    ) -> Result<NextStep> {
        let mut records = completed;
        let mut queue = remaining.into_iter();

        while let Some(action) = queue.next() {
            let request = ActionRequest::new(role, action);
            let record = match self.surface.submit(task_id, &request).await {
                Submission::Done(record) => record,
                Submission::NeedsApproval { action, verdict } => {
                    match self.approver.decide(task_id, &request, &verdict).await {
                        ApprovalDecision::Approve => {
                            self.surface.execute(task_id, &action, ApprovedBy::Human).await
                        }
                        ApprovalDecision::Deny { reason } => ActionRecord {
                            action,
                            status: ActionStatus::Denied { reason },
                        },
                        ApprovalDecision::Defer => {
                            let pending = PendingApproval {
                                token: PendingApproval::new_token(),
                                task_id: task_id.to_string(),
                                role,
                                action,
                                rule: verdict.rule,
                                outcome,
                                notes,
                                completed: records,
                                remaining: queue.by_ref().collect(),
                                created_at: Utc::now(),
                            };
                            return self.park(pending);
                        }
                    }
                }
            };

            self.audit_with(|log, sid| log.log_action(sid, task_id, &record));
            if record.status.is_denial() {
                let reason = denial_reason(&record);
                records.push(record);
                let skipped = queue.len();
                if skipped > 0 {
                    debug!(task_id, skipped, "Skipping actions after a denial");
                }
                return self.finish_turn(task_id, &RoleOutcome::PolicyDenied { reason }, notes, records);
            }
            records.push(record);
        }

        let outcome = match outcome {
            OutcomeTag::Approve => RoleOutcome::Approve,
            OutcomeTag::Reject => RoleOutcome::Reject,
        };
        self.finish_turn(task_id, &outcome, notes, records)
    }

    fn park(&mut self, pending: PendingApproval) -> Result<NextStep> {
        warn!(
            task_id = %pending.task_id,
            token = %pending.token,
            "Action needs approval: {}",
            pending.describe()
        );
        let data = json!({
            "kind": pending.action.kind(),
            "action": pending.action.describe(),
            "status": "pending",
            "token": pending.token,
            "rule": pending.rule,
        });
        let task_id = pending.task_id.clone();
        self.state.pending_approval = Some(pending);
        self.persist()?;
        self.audit_with(|log, sid| {
            log.log_event(AuditEventType::ActionDecision, sid, Some(&task_id), data)
        });
        Ok(self.next_step())
    }

    fn finish_turn(
        &mut self,
        task_id: &str,
        outcome: &RoleOutcome,
        notes: Option<serde_json::Value>,
        actions: Vec<ActionRecord>,
    ) -> Result<NextStep> {
        let settings = self.state.settings;
        let task = self.state.task_mut(task_id)?;
        let role = task.status.acting_role();
        let change = transition::apply(task, outcome, &settings)?;
        let sequence = task.next_sequence();
        task.attempts.push(AttemptRecord {
            sequence,
            role,
            recorded_at: Utc::now(),
            outcome: outcome.to_attempt(),
            notes,
            actions,
            status_before: change.from,
            status_after: change.to,
            iteration_after: change.iteration,
        });
        let id = task.id.clone();
        self.persist()?;

        let label = outcome.to_attempt().label();
        info!(
            task_id = %id,
            from = %change.from,
            to = %change.to,
            iteration = change.iteration,
            outcome = label,
            "Turn finished"
        );
        self.audit_with(|log, sid| {
            log.log_transition(sid, &id, change.from, change.to, label, change.iteration)
        });
        if let Some(reason) = &change.escalation {
            warn!(task_id = %id, "Escalating: {reason}");
            self.audit_with(|log, sid| log.log_escalation(sid, &id, reason));
        }
        Ok(self.next_step())
    }

    fn persist(&mut self) -> Result<()> {
        self.state.touch();
        self.persistence.save(&self.state)
    }

    fn audit_with<F>(&self, write: F)
    where
        F: FnOnce(&AuditLogger, &str) -> anyhow::Result<AuditEntry>,
    {
        if let Err(e) = write(&self.audit, &self.state.metadata.session_id) {
            warn!("Failed to write audit entry: {e:#}");
        }
    }
}

fn denial_reason(record: &ActionRecord) -> String {
    match &record.status {
        ActionStatus::Blocked { rule } => {
            format!("{} blocked by {rule}", record.action.describe())
        }
        ActionStatus::Denied { reason } => {
            format!("{} denied: {reason}", record.action.describe())
        }
        other => format!("{} {}", record.action.describe(), other.label()),
    }
}

/// Ask the planner for the task breakdown of `goal`.
///
/// Empty task lists and driver failures are retried up to `retries` times.
/// Actions requested by the planner are never run.
pub async fn plan_tasks(
    drivers: &DriverSet,
    goal: &str,
    workspace: &Workspace,
    options: &SchedulerOptions,
    retries: u32,
) -> Result<Vec<String>> {
    let driver = drivers.for_role(Role::Planner)?;
    let context = ContextBuilder::new(options.context_max_chars).for_plan(goal, workspace);
    let mut last_error = String::new();

    for attempt in 1..=retries + 1 {
        let request = DriverRequest {
            role: Role::Planner,
            goal: goal.to_string(),
            task: None,
            context: context.clone(),
        };
        match invoke_with_deadline(driver.as_ref(), request, options.driver_timeout).await {
            Ok(response) => {
                if !response.actions.is_empty() {
                    warn!(
                        count = response.actions.len(),
                        "Planner requested actions; planner turns do not act"
                    );
                }
                let tasks: Vec<String> = response
                    .tasks
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                if !tasks.is_empty() {
                    info!(tasks = tasks.len(), "Plan received");
                    return Ok(tasks);
                }
                last_error = "planner returned no tasks".to_string();
            }
            Err(failure) => last_error = failure.to_string(),
        }
        warn!(attempt, "Planner turn unusable: {last_error}");
    }

    Err(TetradError::driver(
        Role::Planner,
        format!("no usable plan after {} attempts: {last_error}", retries + 1),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedApprover, ScriptedDriver, TestProject};
    use serde_json::json;

    fn write(path: &str, content: &str) -> Action {
        Action::Write {
            path: path.into(),
            content: content.into(),
        }
    }

    fn shell(command: &str) -> Action {
        Action::ExecuteShell {
            command: command.into(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_every_task() {
        let project = TestProject::new();
        let driver = ScriptedDriver::always_approve();
        let mut scheduler = project
            .scheduler(&["first", "second"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver.clone())));

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Complete);
        assert!(scheduler.state().is_complete());
        // implementer, reviewer, tester for each task
        assert_eq!(driver.calls(), 6);

        let roles: Vec<Role> = driver.requests().iter().map(|r| r.role).collect();
        assert_eq!(
            &roles[..3],
            &[Role::Implementer, Role::Reviewer, Role::Tester]
        );

        let persisted = project.persistence().load_required().unwrap();
        assert_eq!(&persisted, scheduler.state());
    }

    #[tokio::test]
    async fn test_review_rejection_loops_back() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject().with_notes(json!({"defects": ["no tests"]})))
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["only"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver.clone())));

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        let task = scheduler.state().task("task-1").unwrap();
        assert_eq!(task.iteration, 1);
        assert_eq!(task.attempts.len(), 5);

        // the implementer's second turn sees the reviewer's notes
        let rework = &driver.requests()[2];
        assert_eq!(rework.role, Role::Implementer);
        assert!(rework.context.contains("no tests"));
    }

    #[tokio::test]
    async fn test_ceiling_escalates_and_halts() {
        let project = TestProject::new().with_max_iterations(2);
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject());
        let mut scheduler = project
            .scheduler(&["hard", "never reached"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver.clone())));

        let outcome = scheduler.run().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::EscalationPending {
                ref task_id,
                reason: EscalationReason::IterationCeiling { ceiling: 2 }
            } if task_id == "task-1"
        ));
        assert_eq!(outcome.exit_code(), 3);
        let state = scheduler.state();
        assert_eq!(state.tasks[0].iteration, 2);
        assert_eq!(state.tasks[1].status, TaskStatus::Pending);
        assert_eq!(driver.calls(), 6);
    }

    #[tokio::test]
    async fn test_malformed_response_retried_without_iteration() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .fail("not json")
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)));

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        let task = scheduler.state().task("task-1").unwrap();
        assert_eq!(task.iteration, 0);
        assert!(matches!(
            task.attempts[0].outcome,
            AttemptOutcome::Transient { .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_consumes_iteration() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .delay(Duration::from_secs(5), DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_options(SchedulerOptions {
                driver_timeout: Duration::from_millis(50),
                heartbeat: Duration::from_millis(10),
                context_max_chars: 4000,
            });

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        let task = scheduler.state().task("task-1").unwrap();
        assert_eq!(task.iteration, 1);
        assert!(matches!(
            task.attempts[0].outcome,
            AttemptOutcome::TimedOut { .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_persisted_during_slow_call() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .delay(Duration::from_millis(120), DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_options(SchedulerOptions {
                driver_timeout: Duration::from_secs(5),
                heartbeat: Duration::from_millis(20),
                context_max_chars: 4000,
            });

        scheduler.run().await.unwrap();
        assert!(scheduler.state().metadata.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_hard_block_is_policy_denial() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve().with_action(shell("rm -rf /")))
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let approver = ScriptedApprover::new();
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_approver(Arc::new(approver.clone()));

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        assert_eq!(approver.asked(), 0);

        let task = scheduler.state().task("task-1").unwrap();
        assert_eq!(task.iteration, 0);
        let first = &task.attempts[0];
        assert!(matches!(first.outcome, AttemptOutcome::PolicyDenied { .. }));
        assert!(matches!(first.actions[0].status, ActionStatus::Blocked { .. }));
        assert_eq!(first.status_after, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_confirmation_runs_after_approval() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve().with_action(shell("ls")))
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let approver = ScriptedApprover::new().approve();
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_approver(Arc::new(approver.clone()));

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        assert_eq!(approver.asked(), 1);
        let action = &scheduler.state().tasks[0].attempts[0].actions[0];
        assert!(matches!(
            action.status,
            ActionStatus::Executed {
                approved_by: ApprovedBy::Human,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_deferred_approval_parks_and_resumes() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new().respond(
            DriverResponse::approve()
                .with_action(write("a.txt", "one"))
                .with_action(write("b.txt", "two")),
        );
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)));

        let outcome = scheduler.run().await.unwrap();
        let RunOutcome::AwaitingApproval { token, .. } = outcome else {
            panic!("expected a pending approval, got {outcome:?}");
        };
        assert!(!project.path("a.txt").exists());

        // the parked turn survives a restart
        let persisted = project.persistence().load_required().unwrap();
        assert_eq!(persisted.pending_approval.as_ref().unwrap().token, token);

        let approver = ScriptedApprover::new().approve();
        let mut resumed = project
            .scheduler_from(persisted)
            .with_approver(Arc::new(approver));
        let next = resumed
            .resolve_approval(&token, ApprovalDecision::Approve)
            .await
            .unwrap();

        assert_eq!(project.read("a.txt"), "one");
        assert_eq!(project.read("b.txt"), "two");
        assert!(resumed.state().pending_approval.is_none());
        assert_eq!(resumed.state().tasks[0].status, TaskStatus::InReview);
        assert_eq!(
            next,
            NextStep::Invoke {
                task_id: "task-1".into(),
                role: Role::Reviewer
            }
        );
    }

    #[tokio::test]
    async fn test_denied_approval_counts_as_policy_denial() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve().with_action(write("a.txt", "x")));
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)));
        let RunOutcome::AwaitingApproval { token, .. } = scheduler.run().await.unwrap() else {
            panic!("expected a pending approval");
        };

        scheduler
            .resolve_approval(&token, ApprovalDecision::deny("not now"))
            .await
            .unwrap();

        let task = &scheduler.state().tasks[0];
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.iteration, 0);
        assert_eq!(task.consecutive_denials, 1);
        assert!(!project.path("a.txt").exists());
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let project = TestProject::new();
        let mut scheduler = project.scheduler(&["t"]);
        let err = scheduler
            .resolve_approval("nope", ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, TetradError::UnknownApproval { .. }));
    }

    #[tokio::test]
    async fn test_resume_from_review_with_count_three() {
        let project = TestProject::new();
        let mut state = project.state(&["done already", "in flight", "later"]);
        state.tasks[0].status = TaskStatus::Done;
        state.tasks[1].status = TaskStatus::InReview;
        state.tasks[1].iteration = 3;
        state.active_index = Some(1);
        project.persistence().save(&state).unwrap();

        let loaded = project.persistence().load_required().unwrap();
        // reviewer and tester approve; the script then runs dry on task-3
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler_from(loaded)
            .with_drivers(DriverSet::new().with_default(Arc::new(driver.clone())));

        assert_eq!(
            scheduler.next_step(),
            NextStep::Invoke {
                task_id: "task-2".into(),
                role: Role::Reviewer
            }
        );
        let outcome = scheduler.run().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::EscalationPending { ref task_id, .. } if task_id == "task-3"
        ));

        let requests = driver.requests();
        let brief = requests[0].task.as_ref().unwrap();
        assert_eq!(requests[0].role, Role::Reviewer);
        assert_eq!(brief.id, "task-2");
        assert_eq!(brief.iteration, 3);
        assert_eq!(requests[1].role, Role::Tester);
        assert!(requests
            .iter()
            .all(|r| r.task.as_ref().unwrap().id != "task-1"));

        let state = scheduler.state();
        assert_eq!(state.tasks[0].attempts.len(), 0);
        assert_eq!(state.tasks[1].status, TaskStatus::Done);
        assert_eq!(state.tasks[1].iteration, 3);
    }

    #[tokio::test]
    async fn test_stop_signal_checked_before_first_turn() {
        let project = TestProject::new();
        let driver = ScriptedDriver::always_approve();
        let stop = StopSignal::new();
        stop.request();
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver.clone())))
            .with_stop_signal(stop);

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(outcome.exit_code(), 5);
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_retry_then_complete() {
        let project = TestProject::new().with_max_iterations(1);
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::reject())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)));
        assert!(matches!(
            scheduler.run().await.unwrap(),
            RunOutcome::EscalationPending { .. }
        ));

        let next = scheduler.resolve_escalation("1", Resolution::Retry).unwrap();
        assert!(matches!(next, NextStep::Invoke { role: Role::Implementer, .. }));
        let task = &scheduler.state().tasks[0];
        assert_eq!(task.iteration, 0);
        assert_eq!(task.attempts.last().unwrap().role, None);

        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
    }

    #[tokio::test]
    async fn test_resolve_requires_escalated_task() {
        let project = TestProject::new();
        let mut scheduler = project.scheduler(&["t"]);
        assert!(matches!(
            scheduler.resolve_escalation("task-1", Resolution::MarkDone),
            Err(TetradError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.resolve_escalation("task-9", Resolution::MarkDone),
            Err(TetradError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn test_undo_restores_and_is_idempotent() {
        let project = TestProject::new();
        project.write("keep.txt", "original");
        let driver = ScriptedDriver::new()
            .respond(
                DriverResponse::approve()
                    .with_action(write("keep.txt", "changed"))
                    .with_action(write("new.txt", "fresh")),
            )
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_approver(Arc::new(ScriptedApprover::new().approve().approve()));
        assert_eq!(scheduler.run().await.unwrap(), RunOutcome::Complete);
        assert_eq!(project.read("keep.txt"), "changed");

        let report = scheduler.undo("task-1").unwrap();
        assert_eq!(report.restored.len(), 1);
        assert_eq!(report.removed.len(), 1);
        assert_eq!(project.read("keep.txt"), "original");
        assert!(!project.path("new.txt").exists());

        let again = scheduler.undo("task-1").unwrap();
        assert!(again.is_empty());
        assert_eq!(project.read("keep.txt"), "original");
    }

    #[tokio::test]
    async fn test_outside_write_rejected_before_snapshot() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve().with_action(write("../escape.txt", "x")))
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve());
        let approver = ScriptedApprover::new();
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(driver)))
            .with_approver(Arc::new(approver.clone()));

        scheduler.run().await.unwrap();
        assert_eq!(approver.asked(), 0);
        let record = &scheduler.state().tasks[0].attempts[0].actions[0];
        assert!(matches!(record.status, ActionStatus::Rejected { .. }));
        assert!(scheduler
            .surface()
            .snapshots()
            .snapshots_for("task-1")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_advance_reports_next_role() {
        let project = TestProject::new();
        let mut scheduler = project.scheduler(&["t"]);
        scheduler.activate("task-1").unwrap();

        let next = scheduler
            .advance("task-1", RoleOutcome::Approve, None)
            .unwrap();
        assert_eq!(
            next,
            NextStep::Invoke {
                task_id: "task-1".into(),
                role: Role::Reviewer
            }
        );
        let persisted = project.persistence().load_required().unwrap();
        assert_eq!(persisted.tasks[0].status, TaskStatus::InReview);
    }

    #[tokio::test]
    async fn test_audit_chain_covers_run() {
        let project = TestProject::new();
        let mut scheduler = project
            .scheduler(&["t"])
            .with_drivers(DriverSet::new().with_default(Arc::new(ScriptedDriver::always_approve())));
        scheduler.record_start().unwrap();
        scheduler.run().await.unwrap();

        let audit = project.audit();
        assert!(audit.verify().unwrap().is_valid);
        let transitions = audit
            .read_entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::TaskTransition)
            .count();
        // activation plus three turns
        assert_eq!(transitions, 4);
    }

    #[tokio::test]
    async fn test_plan_tasks_retries_empty_plan() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new()
            .respond(DriverResponse::approve())
            .respond(DriverResponse::approve().with_tasks(["design", " ", "build"]));
        let drivers = DriverSet::new().with_role(Role::Planner, Arc::new(driver));

        let tasks = plan_tasks(&drivers, "goal", project.workspace(), &SchedulerOptions::default(), 1)
            .await
            .unwrap();
        assert_eq!(tasks, vec!["design", "build"]);
    }

    #[tokio::test]
    async fn test_plan_tasks_gives_up() {
        let project = TestProject::new();
        let driver = ScriptedDriver::new().fail("down").fail("down");
        let drivers = DriverSet::new().with_default(Arc::new(driver));
        let err = plan_tasks(&drivers, "goal", project.workspace(), &SchedulerOptions::default(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TetradError::Driver { .. }));
    }
}
