//! The safety gate: a pure evaluation of an action against the policy table.

use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Disposition, PolicyRule};
use crate::config::{DANGEROUS_COMMAND_PATTERNS, DANGEROUS_COMMAND_REGEXES};
use crate::error::{Result, TetradError};
use crate::tools::{Action, ActionKind};
use crate::workspace::{Workspace, CONTROL_DIR};

/// The gate's decision and the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub disposition: Disposition,
    pub rule: String,
    /// Whether the rule is one of the non-overridable built-ins.
    pub builtin: bool,
}

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    ControlDir,
    PathGlob(GlobMatcher),
    CommandRegex(Regex),
    CommandContains(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    label: String,
    kind: Option<ActionKind>,
    matcher: Matcher,
    disposition: Disposition,
    builtin: bool,
}

impl CompiledRule {
    fn compile(rule: &PolicyRule) -> std::result::Result<Self, String> {
        rule.validate()?;
        let matcher = if let Some(glob) = &rule.path_glob {
            let glob = GlobBuilder::new(glob)
                .literal_separator(true)
                .build()
                .map_err(|e| format!("invalid path_glob: {e}"))?;
            Matcher::PathGlob(glob.compile_matcher())
        } else if let Some(re) = &rule.command_regex {
            Matcher::CommandRegex(Regex::new(re).map_err(|e| format!("invalid command_regex: {e}"))?)
        } else if let Some(needle) = &rule.command_contains {
            Matcher::CommandContains(collapse_whitespace(needle))
        } else {
            Matcher::Any
        };
        Ok(Self {
            label: rule.label(),
            kind: rule.kind,
            matcher,
            disposition: rule.disposition,
            builtin: false,
        })
    }

    fn builtin(label: String, kind: ActionKind, matcher: Matcher) -> Self {
        Self {
            label: format!("builtin: {label}"),
            kind: Some(kind),
            matcher,
            disposition: Disposition::HardBlock,
            builtin: true,
        }
    }

    fn matches(&self, action: &Action, normalized_command: Option<&str>) -> bool {
        if self.kind.is_some_and(|k| k != action.kind()) {
            return false;
        }
        match &self.matcher {
            Matcher::Any => true,
            Matcher::ControlDir => action
                .path()
                .is_some_and(|p| Workspace::is_control_path(Path::new(p))),
            Matcher::PathGlob(glob) => action.path().is_some_and(|p| glob.is_match(p)),
            Matcher::CommandRegex(re) => action.command().is_some_and(|c| re.is_match(c)),
            Matcher::CommandContains(needle) => {
                normalized_command.is_some_and(|c| c.contains(needle.as_str()))
            }
        }
    }

    fn verdict(&self) -> Verdict {
        Verdict {
            disposition: self.disposition,
            rule: self.label.clone(),
            builtin: self.builtin,
        }
    }
}

/// Compiled policy table.
///
/// Paths in evaluated actions must already be workspace-relative (the tool
/// surface resolves them before asking the gate).
#[derive(Debug, Clone)]
pub struct SafetyGate {
    hard_blocks: Vec<CompiledRule>,
    specific: Vec<CompiledRule>,
    kind_level: Vec<CompiledRule>,
}

impl SafetyGate {
    /// Compile configured rules on top of the built-in hard blocks.
    pub fn new(rules: &[PolicyRule]) -> Result<Self> {
        let mut hard_blocks = builtin_hard_blocks()?;
        let mut specific = Vec::new();
        let mut kind_level = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            let compiled = CompiledRule::compile(rule)
                .map_err(|reason| TetradError::invalid_config(format!("policy.rules[{i}]"), reason))?;
            if compiled.disposition == Disposition::HardBlock {
                hard_blocks.push(compiled);
            } else if rule.has_pattern() {
                specific.push(compiled);
            } else {
                kind_level.push(compiled);
            }
        }

        Ok(Self {
            hard_blocks,
            specific,
            kind_level,
        })
    }

    /// Evaluate an action. First matching rule wins within each phase.
    #[must_use]
    pub fn evaluate(&self, action: &Action) -> Verdict {
        let normalized = action.command().map(collapse_whitespace);
        let normalized = normalized.as_deref();

        self.hard_blocks
            .iter()
            .chain(&self.specific)
            .chain(&self.kind_level)
            .find(|rule| rule.matches(action, normalized))
            .map(CompiledRule::verdict)
            .unwrap_or_else(|| Self::kind_default(action.kind()))
    }

    /// Built-in disposition when no rule matches.
    #[must_use]
    pub fn kind_default(kind: ActionKind) -> Verdict {
        let disposition = match kind {
            ActionKind::Read | ActionKind::Search => Disposition::AutoApprove,
            ActionKind::Write | ActionKind::ExecuteShell => Disposition::RequireConfirmation,
        };
        Verdict {
            disposition,
            rule: format!("default: {kind} -> {disposition}"),
            builtin: true,
        }
    }
}

fn builtin_hard_blocks() -> Result<Vec<CompiledRule>> {
    let mut rules = vec![CompiledRule::builtin(
        format!("writes into {CONTROL_DIR}/"),
        ActionKind::Write,
        Matcher::ControlDir,
    )];

    let control_ref = format!(r#"(^|[\s;&|'"=/<>]){}\b"#, regex::escape(CONTROL_DIR));
    rules.push(CompiledRule::builtin(
        format!("shell access to {CONTROL_DIR}/"),
        ActionKind::ExecuteShell,
        Matcher::CommandRegex(compile_builtin(&control_ref)?),
    ));

    for pattern in DANGEROUS_COMMAND_PATTERNS {
        rules.push(CompiledRule::builtin(
            format!("destructive command {pattern:?}"),
            ActionKind::ExecuteShell,
            Matcher::CommandContains(collapse_whitespace(pattern)),
        ));
    }
    for (pattern, description) in DANGEROUS_COMMAND_REGEXES {
        rules.push(CompiledRule::builtin(
            (*description).to_string(),
            ActionKind::ExecuteShell,
            Matcher::CommandRegex(compile_builtin(pattern)?),
        ));
    }
    Ok(rules)
}

fn compile_builtin(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| TetradError::config(format!("built-in pattern {pattern:?} is invalid: {e}")))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
