//! tetrad - multi-role coding agent orchestration
//!
//! Coordinates a planner, an implementer, a reviewer and a tester working in
//! rounds against a shared workspace. Every file write and shell command a
//! role asks for passes a risk-based safety gate, and every write is
//! snapshotted first so a task's changes can be undone.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`scheduler`] - Turn scheduler, task transitions and context building
//! - [`session`] - Resumable session state and its atomic persistence
//! - [`task`] - Task records, status state machine and plan parsing
//! - [`policy`] - Policy rules and the safety gate
//! - [`tools`] - Read, search, write, insert and shell tools behind the gate
//! - [`snapshot`] - Content-addressed pre-write backups and undo
//! - [`approval`] - Human approval of confirmation-required actions
//! - [`driver`] - The role driver boundary and the external-command driver
//! - [`audit`] - Hash-chained audit log
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (scripted drivers, assertions)
//!
//! # Example
//!
//! ```rust,ignore
//! use tetrad::{ProjectConfig, SafetyGate, Scheduler, SessionState, ToolSurface, Workspace};
//!
//! let workspace = Workspace::open(".")?;
//! let config = ProjectConfig::load(workspace.root())?;
//! let gate = SafetyGate::new(&config.policy.rules)?;
//! let surface = ToolSurface::new(workspace.clone(), gate, config.shell.clone());
//!
//! let state = SessionState::new("add a parser", (&config.orchestrator).into(), ["lexer", "parser"]);
//! let mut scheduler = Scheduler::new(state, persistence, surface, audit)
//!     .with_drivers(DriverSet::from_config(&config.driver, workspace.root(), None)?);
//! let outcome = scheduler.run().await?;
//! ```

pub mod approval;
pub mod audit;
pub mod config;
pub mod driver;
pub mod error;
pub mod policy;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod task;
pub mod testing;
pub mod tools;
pub mod workspace;

// Re-export commonly used types
pub use error::{Result, TetradError};

pub use config::{ProjectConfig, DANGEROUS_COMMAND_PATTERNS, DANGEROUS_COMMAND_REGEXES};
pub use workspace::Workspace;

pub use approval::{ApprovalDecision, Approver, DeferredApprover, InteractiveApprover, PendingApproval};
pub use audit::{AuditEventType, AuditLogger, VerificationResult};
pub use driver::{CommandDriver, DriverRequest, DriverResponse, DriverSet, OutcomeTag, Role, RoleDriver};
pub use policy::{Disposition, PolicyRule, SafetyGate, Verdict};
pub use scheduler::{plan_tasks, NextStep, RoleOutcome, RunOutcome, Scheduler, SchedulerOptions};
pub use session::{SessionPersistence, SessionSettings, SessionState, StopSignal};
pub use snapshot::{SnapshotStore, UndoReport};
pub use task::{EscalationReason, Resolution, Task, TaskStatus};
pub use tools::{Action, ActionKind, ActionRecord, ActionRequest, ActionStatus, ToolSurface};

// Re-export testing types for convenience
pub use testing::{ScriptedApprover, ScriptedDriver};
