//! Action policy: rules, dispositions and the safety gate.
//!
//! A [`PolicyRule`] maps an action kind and an optional path or command
//! pattern to a [`Disposition`]. The [`SafetyGate`] compiles configured
//! rules together with the built-in hard blocks and evaluates requests in a
//! fixed order:
//!
//! ```text
//! hard_block rules (built-in, then configured)
//!    │  no match
//!    ▼
//! rules with a path/command pattern (configured order)
//!    │  no match
//!    ▼
//! kind-level rules without a pattern (configured order)
//!    │  no match
//!    ▼
//! built-in kind defaults (read/search auto, write/execute_shell confirm)
//! ```

pub mod gate;

pub use gate::{SafetyGate, Verdict};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tools::ActionKind;

/// What the gate decides for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    AutoApprove,
    RequireConfirmation,
    HardBlock,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::AutoApprove => "auto_approve",
            Disposition::RequireConfirmation => "require_confirmation",
            Disposition::HardBlock => "hard_block",
        };
        f.write_str(s)
    }
}

/// A configured policy rule.
///
/// At most one pattern may be set. `path_glob` applies to actions that
/// target a path; the command patterns apply to `execute_shell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `None` matches every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_contains: Option<String>,
    pub disposition: Disposition,
}

impl PolicyRule {
    /// Kind-level rule without a pattern.
    #[must_use]
    pub fn for_kind(kind: ActionKind, disposition: Disposition) -> Self {
        Self {
            name: None,
            kind: Some(kind),
            path_glob: None,
            command_regex: None,
            command_contains: None,
            disposition,
        }
    }

    /// Set a path glob.
    #[must_use]
    pub fn with_path_glob(mut self, glob: impl Into<String>) -> Self {
        self.path_glob = Some(glob.into());
        self
    }

    /// Set a command regex.
    #[must_use]
    pub fn with_command_regex(mut self, regex: impl Into<String>) -> Self {
        self.command_regex = Some(regex.into());
        self
    }

    /// Set a command substring.
    #[must_use]
    pub fn with_command_contains(mut self, needle: impl Into<String>) -> Self {
        self.command_contains = Some(needle.into());
        self
    }

    /// Set a display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether the rule narrows its kind with a pattern.
    #[must_use]
    pub fn has_pattern(&self) -> bool {
        self.path_glob.is_some() || self.command_regex.is_some() || self.command_contains.is_some()
    }

    /// Human-readable label used in verdicts and audit entries.
    #[must_use]
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let kind = self
            .kind
            .map_or_else(|| "any".to_string(), |k| k.to_string());
        let pattern = if let Some(glob) = &self.path_glob {
            format!(" path {glob}")
        } else if let Some(re) = &self.command_regex {
            format!(" command ~ /{re}/")
        } else if let Some(needle) = &self.command_contains {
            format!(" command contains {needle:?}")
        } else {
            String::new()
        };
        format!("{kind}{pattern} -> {}", self.disposition)
    }

    /// Check the rule is well-formed; returns the reason when it is not.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let patterns = [
            self.path_glob.is_some(),
            self.command_regex.is_some(),
            self.command_contains.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if patterns > 1 {
            return Err("at most one of path_glob, command_regex, command_contains may be set".into());
        }
        let command_pattern = self.command_regex.is_some() || self.command_contains.is_some();
        if command_pattern && matches!(self.kind, Some(k) if k != ActionKind::ExecuteShell) {
            return Err("command patterns only apply to execute_shell rules".into());
        }
        if self.path_glob.is_some() && self.kind == Some(ActionKind::ExecuteShell) {
            return Err("path_glob does not apply to execute_shell rules".into());
        }
        if let Some(glob) = &self.path_glob {
            globset::Glob::new(glob).map_err(|e| format!("invalid path_glob: {e}"))?;
        }
        if let Some(re) = &self.command_regex {
            regex::Regex::new(re).map_err(|e| format!("invalid command_regex: {e}"))?;
        }
        Ok(())
    }
}
