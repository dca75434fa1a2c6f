//! Custom error types for tetrad.
//!
//! Every fallible library operation returns [`TetradError`]. Turn-level
//! problems that the scheduler recovers from (malformed driver output,
//! denied actions, failed tool calls) are not errors at this level; they are
//! recorded on the task's attempt history instead. What reaches the caller
//! here is either a configuration problem, a misuse of the API, or a
//! persistence failure that must halt the process.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tetrad operations
#[derive(Error, Debug)]
pub enum TetradError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Session state could not be durably written or read back.
    ///
    /// Always fatal: progressing without a persisted decision breaks resume.
    #[error("Persistence failure at {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// No persisted session exists to resume
    #[error("No session found in {}", dir.display())]
    NoSession { dir: PathBuf },

    /// A session already exists and would be overwritten
    #[error("An unfinished session already exists in {} (use --force to discard it)", dir.display())]
    SessionExists { dir: PathBuf },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// Action refused by a hard-block rule or by a human
    #[error("Policy denied {action}: {reason}")]
    PolicyDenied { action: String, reason: String },

    // =========================================================================
    // Tool Errors
    // =========================================================================
    /// Path escapes the workspace root
    #[error("Path '{path}' resolves outside the workspace root")]
    OutsideWorkspace { path: String },

    /// Insertion line out of the file's bounds
    #[error("Line {line} is out of range for '{path}' ({len} lines)")]
    LineOutOfRange { path: String, line: usize, len: usize },

    /// Tool execution failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Snapshot store operation failed
    #[error("Snapshot error: {message}")]
    Snapshot { message: String },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    /// Role driver produced output that does not fit the response shape
    #[error("Malformed response from {role} driver: {message}")]
    MalformedResponse { role: String, message: String },

    /// Role driver could not be invoked
    #[error("{role} driver failed: {message}")]
    Driver { role: String, message: String },

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// Unknown task id
    #[error("Unknown task: {id}")]
    UnknownTask { id: String },

    /// Transition not allowed by the task state machine
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Unknown or already resolved approval token
    #[error("No pending approval with token {token}")]
    UnknownApproval { token: String },

    /// Audit chain is inconsistent
    #[error("Audit log error: {message}")]
    Audit { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TetradError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a persistence failure
    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a tool execution error
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a snapshot error
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
        }
    }

    /// Create a driver error
    pub fn driver(role: impl ToString, message: impl Into<String>) -> Self {
        Self::Driver {
            role: role.to_string(),
            message: message.into(),
        }
    }

    /// Create a malformed response error
    pub fn malformed(role: impl ToString, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            role: role.to_string(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error must halt the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }

    /// Check if this error is a transient driver problem worth one retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::MalformedResponse { .. } | Self::Driver { .. })
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied { .. } | Self::SessionExists { .. } | Self::Persistence { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyDenied { .. } | Self::OutsideWorkspace { .. } => 2,
            Self::NoSession { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::Persistence { .. } => 10,
            _ => 1,
        }
    }
}

/// Type alias for tetrad results
pub type Result<T> = std::result::Result<T, TetradError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetradError::LineOutOfRange {
            path: "src/lib.rs".into(),
            line: 42,
            len: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("src/lib.rs"));
    }

    #[test]
    fn test_persistence_is_fatal() {
        let err = TetradError::persistence("/tmp/session.json", "disk full");
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 10);
        assert!(!TetradError::config("bad").is_fatal());
    }

    #[test]
    fn test_is_transient() {
        assert!(TetradError::malformed("reviewer", "missing outcome").is_transient());
        assert!(TetradError::driver("tester", "exit 1").is_transient());
        assert!(!TetradError::snapshot("gone").is_transient());
    }

    #[test]
    fn test_requires_human() {
        let err = TetradError::PolicyDenied {
            action: "execute_shell".into(),
            reason: "rm -rf /".into(),
        };
        assert!(err.requires_human());
        assert!(!TetradError::tool("read", "missing").requires_human());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TetradError::config("test").exit_code(), 7);
        assert_eq!(
            TetradError::NoSession {
                dir: PathBuf::from(".tetrad")
            }
            .exit_code(),
            6
        );
        assert_eq!(
            TetradError::OutsideWorkspace {
                path: "../etc".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(TetradError::snapshot("x").exit_code(), 1);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/tetrad.toml");
        let err = TetradError::config_with_path("failed to parse", path.clone());
        if let TetradError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: TetradError = io.into();
        assert!(matches!(err, TetradError::Io(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
