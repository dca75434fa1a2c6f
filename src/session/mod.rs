//! Session state and recovery.
//!
//! The session is the single durable record of a run: the ordered task list,
//! which task is active, the limits the run was started with and any
//! outstanding approval. The scheduler owns it exclusively and persists it
//! after every transition, so a restart picks up exactly where the last
//! decision left off.
//!
//! # Architecture
//!
//! ```text
//! SessionState
//!   ├── metadata: SessionMetadata (version, id, timestamps, revision)
//!   ├── goal
//!   ├── settings: SessionSettings (ceiling, retry and denial limits)
//!   ├── tasks: Vec<Task> (insertion order = execution order)
//!   ├── active_index
//!   └── pending_approval: Option<PendingApproval>
//! ```
//!
//! # Forward Compatibility
//!
//! The metadata carries a schema version. Files written by a newer,
//! incompatible version are refused instead of being silently discarded.

pub mod persistence;
pub mod signals;

pub use persistence::SessionPersistence;
pub use signals::StopSignal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::PendingApproval;
use crate::config::OrchestratorConfig;
use crate::error::{Result, TetradError};
use crate::task::{Task, TaskStatus};

/// Current schema version for session state.
/// Increment when making breaking changes to the serialization format.
pub const SESSION_STATE_VERSION: u32 = 1;

/// Minimum supported schema version for backward compatibility.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Version, identity and timing information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Unique session identifier.
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// When the last scheduling decision was saved.
    pub saved_at: DateTime<Utc>,
    /// Incremented on every scheduling decision.
    pub revision: u64,
    /// Last liveness beat while a driver call was outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = SESSION_STATE_VERSION;

    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: Self::CURRENT_VERSION,
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            saved_at: now,
            revision: 0,
            heartbeat_at: None,
        }
    }

    /// Mark a new scheduling decision.
    pub fn touch(&mut self) {
        self.saved_at = Utc::now();
        self.revision += 1;
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits frozen at session start so a resumed run behaves the same way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_iterations: u32,
    pub transient_retries: u32,
    pub max_consecutive_denials: u32,
}

impl From<&OrchestratorConfig> for SessionSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            transient_retries: config.transient_retries,
            max_consecutive_denials: config.max_consecutive_denials,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

/// The complete resumable record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub metadata: SessionMetadata,
    pub goal: String,
    pub settings: SessionSettings,
    pub tasks: Vec<Task>,
    /// Index of the task currently being worked, once one has been selected.
    #[serde(default)]
    pub active_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
}

impl SessionState {
    /// Create a session whose tasks are the given descriptions, in order.
    #[must_use]
    pub fn new<I, S>(goal: impl Into<String>, settings: SessionSettings, descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tasks = descriptions
            .into_iter()
            .enumerate()
            .map(|(i, d)| Task::new(i, d))
            .collect();
        Self {
            metadata: SessionMetadata::new(),
            goal: goal.into(),
            settings,
            tasks,
            active_index: None,
            pending_approval: None,
        }
    }

    /// Schema version of this state.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.metadata.version
    }

    #[must_use]
    pub fn is_version_compatible(&self) -> bool {
        (MIN_SUPPORTED_VERSION..=SESSION_STATE_VERSION).contains(&self.metadata.version)
    }

    /// Record that a scheduling decision is about to be persisted.
    pub fn touch(&mut self) {
        self.metadata.touch();
    }

    /// The task currently being worked, if any.
    #[must_use]
    pub fn active_task(&self) -> Option<&Task> {
        self.active_index.and_then(|i| self.tasks.get(i))
    }

    pub fn task(&self, id: &str) -> Result<&Task> {
        let id = Task::normalize_id(id);
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(TetradError::UnknownTask { id })
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        let id = Task::normalize_id(id);
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TetradError::UnknownTask { id })
    }

    /// Position of the next task to work on, in list order.
    ///
    /// The active task keeps its slot until it is done; only then does the
    /// first pending task after it take over.
    #[must_use]
    pub fn next_index(&self) -> Option<usize> {
        if let Some(i) = self.active_index {
            if self.tasks.get(i).is_some_and(|t| t.status != TaskStatus::Done) {
                return Some(i);
            }
        }
        let from = self.active_index.map_or(0, |i| i + 1);
        self.tasks
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, t)| t.status != TaskStatus::Done)
            .map(|(i, _)| i)
    }

    /// First escalated task, if any.
    #[must_use]
    pub fn escalated_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Escalated)
    }

    /// Whether every task is done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Done)
    }

    /// Number of tasks in each status, in lifecycle order.
    #[must_use]
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        TaskStatus::ALL
            .iter()
            .map(|s| (*s, self.tasks.iter().filter(|t| t.status == *s).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
