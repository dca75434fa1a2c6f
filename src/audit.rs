//! Audit logging for scheduling decisions.
//!
//! Every task transition, gate decision, approval resolution, escalation
//! and undo is appended to `.tetrad/audit.jsonl`. Entries are hash-chained:
//! each one carries the SHA-256 of its predecessor, so editing or dropping
//! a line breaks [`AuditLogger::verify`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tetrad::audit::{AuditLogger, AuditEventType};
//!
//! let logger = AuditLogger::new(workspace.audit_path())?;
//! logger.log_event(AuditEventType::SessionStart, &session_id, None, json!({"tasks": 3}))?;
//!
//! let result = logger.verify()?;
//! assert!(result.is_valid);
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::task::{EscalationReason, Resolution, TaskStatus};
use crate::tools::ActionRecord;

/// What an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionStart,
    SessionResume,
    /// A task changed status or consumed a turn.
    TaskTransition,
    /// The gate (or a human) decided on an action.
    ActionDecision,
    ApprovalResolved,
    Escalation,
    EscalationResolved,
    Undo,
    SessionEnd,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SessionStart => "session_start",
            Self::SessionResume => "session_resume",
            Self::TaskTransition => "task_transition",
            Self::ActionDecision => "action_decision",
            Self::ApprovalResolved => "approval_resolved",
            Self::Escalation => "escalation",
            Self::EscalationResolved => "escalation_resolved",
            Self::Undo => "undo",
            Self::SessionEnd => "session_end",
        })
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub data: serde_json::Value,
    /// `hash` of the entry before this one; [`GENESIS`] for the first.
    pub previous_hash: String,
    pub hash: String,
}

/// Everything an entry's hash covers, in a fixed field order.
#[derive(Serialize)]
struct Hashed<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    event_type: AuditEventType,
    session_id: &'a str,
    task_id: Option<&'a str>,
    data: &'a serde_json::Value,
    previous_hash: &'a str,
}

impl AuditEntry {
    /// SHA-256 over the canonical JSON of every field except `hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let hashed = Hashed {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            event_type: self.event_type,
            session_id: &self.session_id,
            task_id: self.task_id.as_deref(),
            data: &self.data,
            previous_hash: &self.previous_hash,
        };
        // serializing borrowed plain data cannot fail
        let bytes = serde_json::to_vec(&hashed).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Outcome of [`AuditLogger::verify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    /// Entries checked before the first problem (all of them when valid).
    pub entries_verified: u64,
    pub first_invalid_entry: Option<u64>,
    pub error_description: Option<String>,
}

impl VerificationResult {
    fn intact(entries_verified: u64) -> Self {
        Self {
            is_valid: true,
            entries_verified,
            first_invalid_entry: None,
            error_description: None,
        }
    }

    fn broken(entries_verified: u64, at: u64, why: String) -> Self {
        Self {
            is_valid: false,
            entries_verified,
            first_invalid_entry: Some(at),
            error_description: Some(why),
        }
    }
}

/// `previous_hash` of entry 0.
pub const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Append-only, hash-chained audit log.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    /// Open (or prepare to create) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event chained to the current last entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or the entry written.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        task_id: Option<&str>,
        data: serde_json::Value,
    ) -> Result<AuditEntry> {
        let (sequence, previous_hash) = match self.last_entry()? {
            Some(last) => (last.sequence + 1, last.hash),
            None => (0, GENESIS.to_string()),
        };

        let mut entry = AuditEntry {
            sequence,
            timestamp: Utc::now(),
            event_type,
            session_id: session_id.to_string(),
            task_id: task_id.map(str::to_string),
            data,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("cannot append to {}", self.path.display()))?;
        Ok(entry)
    }

    /// Log a status change (or a turn that kept the status).
    pub fn log_transition(
        &self,
        session_id: &str,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        outcome: &str,
        iteration: u32,
    ) -> Result<AuditEntry> {
        let data = json!({ "from": from, "to": to, "outcome": outcome, "iteration": iteration });
        self.log_event(AuditEventType::TaskTransition, session_id, Some(task_id), data)
    }

    /// Log what became of a requested action.
    pub fn log_action(&self, session_id: &str, task_id: &str, record: &ActionRecord) -> Result<AuditEntry> {
        let data = json!({
            "kind": record.action.kind(),
            "action": record.action.describe(),
            "status": record.status.label(),
        });
        self.log_event(AuditEventType::ActionDecision, session_id, Some(task_id), data)
    }

    pub fn log_escalation(&self, session_id: &str, task_id: &str, reason: &EscalationReason) -> Result<AuditEntry> {
        let data = json!({ "reason": reason, "summary": reason.to_string() });
        self.log_event(AuditEventType::Escalation, session_id, Some(task_id), data)
    }

    pub fn log_escalation_resolved(
        &self,
        session_id: &str,
        task_id: &str,
        resolution: Resolution,
    ) -> Result<AuditEntry> {
        let data = json!({ "resolution": resolution });
        self.log_event(AuditEventType::EscalationResolved, session_id, Some(task_id), data)
    }

    fn contents(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", self.path.display())),
        }
    }

    fn last_entry(&self) -> Result<Option<AuditEntry>> {
        let contents = self.contents()?;
        contents
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("last audit line is not an entry"))
            .transpose()
    }

    /// Every entry, in file order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line does not parse.
    pub fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        self.contents()?
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| format!("audit line {} does not parse", n + 1))
            })
            .collect()
    }

    /// Walk the chain from the genesis value.
    ///
    /// The first entry whose sequence is out of place, whose hash does not
    /// cover its own fields, or whose `previous_hash` is not its
    /// predecessor's hash marks the log as broken.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn verify(&self) -> Result<VerificationResult> {
        let mut expected_previous = GENESIS.to_string();
        let mut checked = 0u64;

        for entry in self.read_entries()? {
            let problem = if entry.sequence != checked {
                Some(format!("Sequence gap: expected {checked}, found {}", entry.sequence))
            } else if !entry.verify_hash() {
                Some("entry content does not match its hash".to_string())
            } else if entry.previous_hash != expected_previous {
                Some("previous_hash does not link to the prior entry".to_string())
            } else {
                None
            };
            if let Some(why) = problem {
                return Ok(VerificationResult::broken(checked, entry.sequence, why));
            }
            expected_previous = entry.hash;
            checked += 1;
        }

        Ok(VerificationResult::intact(checked))
    }

    /// Entries concerning one task.
    pub fn entries_for_task(&self, task_id: &str) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.task_id.as_deref() == Some(task_id));
        Ok(entries)
    }
}
