//! Role drivers: the boundary to the external reasoning backends.
//!
//! A driver receives a [`DriverRequest`] (role, goal, task brief and a
//! bounded context payload) and answers with a [`DriverResponse`]: an
//! approve/reject outcome, optional structured notes and the actions it
//! wants performed. How the answer is produced is the backend's business.
//!
//! The scheduler only sees drivers through the [`RoleDriver`] trait, so a
//! session can be driven by an external command ([`CommandDriver`]) or by
//! scripted mocks in tests.

pub mod command;

pub use command::CommandDriver;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::error::{Result, TetradError};
use crate::task::{Task, TaskStatus};
use crate::tools::Action;

/// The logical roles that take turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Implementer,
    Reviewer,
    Tester,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Planner, Role::Implementer, Role::Reviewer, Role::Tester];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Planner => "planner",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Tester => "tester",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planner" => Ok(Role::Planner),
            "implementer" => Ok(Role::Implementer),
            "reviewer" => Ok(Role::Reviewer),
            "tester" => Ok(Role::Tester),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The verdict half of a driver response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeTag {
    #[serde(alias = "approved", alias = "pass", alias = "passed", alias = "done")]
    Approve,
    #[serde(
        alias = "rejected",
        alias = "fail",
        alias = "failed",
        alias = "changes_requested"
    )]
    Reject,
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeTag::Approve => f.write_str("approve"),
            OutcomeTag::Reject => f.write_str("reject"),
        }
    }
}

/// The slice of a task a driver gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBrief {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub iteration: u32,
    pub max_iterations: u32,
}

impl TaskBrief {
    #[must_use]
    pub fn new(task: &Task, max_iterations: u32) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            iteration: task.iteration,
            max_iterations,
        }
    }
}

/// Outbound half of the driver boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRequest {
    pub role: Role,
    pub goal: String,
    /// Absent for the planner turn, which runs before any task exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskBrief>,
    /// Bounded context payload.
    pub context: String,
}

/// Inbound half of the driver boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub outcome: OutcomeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Task breakdown; only meaningful from the planner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
}

impl DriverResponse {
    /// Bare response with no notes or actions.
    #[must_use]
    pub fn new(outcome: OutcomeTag) -> Self {
        Self {
            outcome,
            notes: None,
            actions: Vec::new(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn approve() -> Self {
        Self::new(OutcomeTag::Approve)
    }

    #[must_use]
    pub fn reject() -> Self {
        Self::new(OutcomeTag::Reject)
    }

    #[must_use]
    pub fn with_notes(mut self, notes: serde_json::Value) -> Self {
        self.notes = Some(notes);
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }
}

/// Parse a driver's raw output into a response.
///
/// Output may wrap the JSON object in prose or a code fence; the outermost
/// `{ ... }` is taken.
pub fn parse_response(role: Role, raw: &str) -> Result<DriverResponse> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TetradError::malformed(role, "empty response"));
    }
    if let Ok(response) = serde_json::from_str::<DriverResponse>(trimmed) {
        return Ok(response);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    let candidate = match (start, end) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(TetradError::malformed(role, "no JSON object in response")),
    };
    serde_json::from_str(candidate).map_err(|e| TetradError::malformed(role, e.to_string()))
}

/// Adapter between the scheduler and a reasoning backend.
#[async_trait]
pub trait RoleDriver: Send + Sync {
    /// Produce a response for one turn.
    ///
    /// # Errors
    ///
    /// Any error is treated as a transient failure of the turn.
    async fn invoke(&self, request: DriverRequest) -> Result<DriverResponse>;
}

/// Why a turn produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFailure {
    /// Malformed or missing response; retried without consuming an iteration.
    Transient(String),
    /// The deadline passed; consumes an iteration.
    TimedOut { after_secs: u64 },
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnFailure::Transient(error) => write!(f, "transient failure: {error}"),
            TurnFailure::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
        }
    }
}

/// Invoke a driver under a deadline and classify the failure, if any.
pub async fn invoke_with_deadline(
    driver: &dyn RoleDriver,
    request: DriverRequest,
    deadline: Duration,
) -> std::result::Result<DriverResponse, TurnFailure> {
    let role = request.role;
    match tokio::time::timeout(deadline, driver.invoke(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            warn!(%role, "Driver turn failed: {e}");
            Err(TurnFailure::Transient(e.to_string()))
        }
        Err(_) => {
            warn!(%role, "Driver turn timed out after {}s", deadline.as_secs());
            Err(TurnFailure::TimedOut {
                after_secs: deadline.as_secs(),
            })
        }
    }
}

/// Drivers for every role, with an optional shared fallback.
#[derive(Clone, Default)]
pub struct DriverSet {
    default: Option<Arc<dyn RoleDriver>>,
    per_role: HashMap<Role, Arc<dyn RoleDriver>>,
}

impl fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut roles: Vec<_> = self.per_role.keys().map(ToString::to_string).collect();
        roles.sort();
        f.debug_struct("DriverSet")
            .field("default", &self.default.as_ref().map(|_| "<dyn RoleDriver>"))
            .field("per_role", &roles)
            .finish()
    }
}

impl DriverSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `driver` for every role without its own.
    #[must_use]
    pub fn with_default(mut self, driver: Arc<dyn RoleDriver>) -> Self {
        self.default = Some(driver);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role, driver: Arc<dyn RoleDriver>) -> Self {
        self.per_role.insert(role, driver);
        self
    }

    /// Build command drivers from configuration. `override_command`, when
    /// given, replaces the shared command (the `--driver` flag).
    pub fn from_config(
        config: &DriverConfig,
        cwd: &Path,
        override_command: Option<&str>,
    ) -> Result<Self> {
        let mut set = Self::new();
        let shared = override_command.or(config.command.as_deref());
        if let Some(command) = shared {
            set = set.with_default(Arc::new(CommandDriver::new(command, cwd)));
        }
        for role in Role::ALL {
            if let Some(command) = config.role_command(role) {
                set = set.with_role(role, Arc::new(CommandDriver::new(command, cwd)));
            }
        }
        if set.default.is_none() && set.per_role.is_empty() {
            return Err(TetradError::config(
                "no role driver configured (set [driver].command or pass --driver)",
            ));
        }
        debug!(?set, "Driver set assembled");
        Ok(set)
    }

    /// Driver responsible for `role`.
    pub fn for_role(&self, role: Role) -> Result<Arc<dyn RoleDriver>> {
        self.per_role
            .get(&role)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| TetradError::config(format!("no driver configured for the {role} role")))
    }
}
