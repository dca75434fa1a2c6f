//! Test fixtures for scheduler-level tests.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::audit::AuditLogger;
use crate::config::ShellConfig;
use crate::policy::SafetyGate;
use crate::scheduler::Scheduler;
use crate::session::{SessionPersistence, SessionSettings, SessionState};
use crate::tools::ToolSurface;
use crate::workspace::Workspace;

/// A temporary workspace with the pieces a [`Scheduler`] needs.
///
/// Automatically cleans up when dropped.
pub struct TestProject {
    _temp_dir: TempDir,
    workspace: Workspace,
    settings: SessionSettings,
}

impl TestProject {
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let workspace = Workspace::open(temp_dir.path()).expect("Failed to open workspace");
        Self {
            _temp_dir: temp_dir,
            workspace,
            settings: SessionSettings::default(),
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.settings.max_iterations = max;
        self
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    #[must_use]
    pub fn path(&self, relative: &str) -> PathBuf {
        self.workspace.root().join(relative)
    }

    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// # Panics
    ///
    /// Panics if the file cannot be read.
    #[must_use]
    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).expect("Failed to read file")
    }

    #[must_use]
    pub fn persistence(&self) -> SessionPersistence {
        SessionPersistence::new(self.workspace.control_dir())
    }

    /// # Panics
    ///
    /// Panics if the audit directory cannot be created.
    #[must_use]
    pub fn audit(&self) -> AuditLogger {
        AuditLogger::new(self.workspace.audit_path()).expect("Failed to open audit log")
    }

    /// A fresh session over the given task descriptions.
    #[must_use]
    pub fn state(&self, tasks: &[&str]) -> SessionState {
        SessionState::new("test goal", self.settings, tasks.iter().copied())
    }

    /// Scheduler over a fresh session with the built-in policy only.
    #[must_use]
    pub fn scheduler(&self, tasks: &[&str]) -> Scheduler {
        self.scheduler_from(self.state(tasks))
    }

    /// # Panics
    ///
    /// Panics if the built-in gate fails to compile.
    #[must_use]
    pub fn scheduler_from(&self, state: SessionState) -> Scheduler {
        let gate = SafetyGate::new(&[]).expect("Failed to build gate");
        let surface = ToolSurface::new(self.workspace.clone(), gate, ShellConfig::default());
        Scheduler::new(state, self.persistence(), surface, self.audit())
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
