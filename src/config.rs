//! Configuration management for tetrad.
//!
//! Configuration is layered: built-in defaults, then the user-level file
//! (`<config dir>/tetrad/config.toml`), then the project file
//! (`<workspace>/tetrad.toml`), then CLI flags. Tables merge key by key,
//! scalars from later layers win, and arrays (policy rules) concatenate so
//! user rules are evaluated before project rules.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::Role;
use crate::error::{Result, TetradError};
use crate::policy::PolicyRule;
use crate::workspace::CONFIG_FILE;

/// Default iteration ceiling per task.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Shell command substrings that are always hard-blocked.
pub const DANGEROUS_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf /*",
    ":(){:|:&};:",
    "dd if=/dev/zero",
    "mkfs.",
    "> /dev/sd",
    "chmod 777",
    "chmod -R 777",
    "sudo rm",
    "sudo dd",
];

/// Shell command regexes that are always hard-blocked.
pub const DANGEROUS_COMMAND_REGEXES: &[(&str, &str)] = &[
    (r"curl[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b", "piping curl into a shell"),
    (r"wget[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b", "piping wget into a shell"),
    (r"chmod\s+(-R\s+)?[0-7]?777\b", "world-writable permissions"),
    (r"(^|[\s;&|'\x22=])\.git/", "direct access to .git internals"),
];

/// Commented default written by `tetrad init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# tetrad configuration
#
# Values here override the user-level config; [[policy.rules]] entries are
# appended after user-level rules.

[orchestrator]
# Rework loops a task may consume before it is escalated to a human.
max_iterations = 5
# Automatic retries of a malformed driver response before escalation.
transient_retries = 1
# Denied turns in a row before the task is escalated.
max_consecutive_denials = 3
# Upper bound on the context payload handed to a role.
context_max_chars = 12000
# Session heartbeat while a driver call is outstanding.
heartbeat_secs = 15

[driver]
# External command invoked for every role. It receives the request as JSON on
# stdin and must print a JSON response on stdout.
# command = "my-agent --json"
# reviewer = "my-agent --json --model reviewer"
timeout_secs = 600

[shell]
timeout_secs = 120
max_output_bytes = 65536

# Rules are evaluated hard_block first, then rules with a pattern, then
# kind-level defaults. Destructive shell commands and writes into .tetrad/
# are always blocked regardless of what is listed here.
#
# [[policy.rules]]
# name = "read-only git"
# kind = "execute_shell"
# command_regex = "^git (status|diff|log)\\b"
# disposition = "auto_approve"
#
# [[policy.rules]]
# kind = "write"
# path_glob = "playground/**"
# disposition = "auto_approve"
"#;

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub transient_retries: u32,
    pub max_consecutive_denials: u32,
    pub context_max_chars: usize,
    pub heartbeat_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            transient_retries: 1,
            max_consecutive_denials: 3,
            context_max_chars: 12_000,
            heartbeat_secs: 15,
        }
    }
}

/// External role driver commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Command used for any role without its own override.
    pub command: Option<String>,
    pub planner: Option<String>,
    pub implementer: Option<String>,
    pub reviewer: Option<String>,
    pub tester: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: None,
            planner: None,
            implementer: None,
            reviewer: None,
            tester: None,
            timeout_secs: 600,
        }
    }
}

impl DriverConfig {
    /// Per-role override, without the shared fallback.
    #[must_use]
    pub fn role_command(&self, role: Role) -> Option<&str> {
        match role {
            Role::Planner => self.planner.as_deref(),
            Role::Implementer => self.implementer.as_deref(),
            Role::Reviewer => self.reviewer.as_deref(),
            Role::Tester => self.tester.as_deref(),
        }
    }
}

/// Limits for the shell tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Configured policy rules, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub rules: Vec<PolicyRule>,
}

/// Complete project configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub orchestrator: OrchestratorConfig,
    pub driver: DriverConfig,
    pub shell: ShellConfig,
    pub policy: PolicyConfig,
}

impl ProjectConfig {
    /// Load the user-level and project configuration for a workspace.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(user) = Self::user_config_path() {
            layers.push(user);
        }
        layers.push(workspace_root.join(CONFIG_FILE));
        Self::load_layers(&layers)
    }

    /// Load and merge the given files in order; missing files are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::Table::new());

        for path in paths {
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let table: toml::Table = toml::from_str(&content).map_err(|e| {
                TetradError::config_with_path(format!("invalid TOML: {e}"), path.clone())
            })?;
            debug!("Loaded configuration layer {}", path.display());
            merge_values(&mut merged, toml::Value::Table(table));
        }

        let rendered = toml::to_string(&merged)
            .map_err(|e| TetradError::config(format!("could not merge configuration: {e}")))?;
        let config: ProjectConfig = toml::from_str(&rendered)
            .map_err(|e| TetradError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// User-level configuration file location.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tetrad").join("config.toml"))
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_iterations == 0 {
            return Err(TetradError::invalid_config(
                "orchestrator.max_iterations",
                "must be at least 1",
            ));
        }
        if self.orchestrator.heartbeat_secs == 0 {
            return Err(TetradError::invalid_config(
                "orchestrator.heartbeat_secs",
                "must be at least 1",
            ));
        }
        if self.driver.timeout_secs == 0 {
            return Err(TetradError::invalid_config(
                "driver.timeout_secs",
                "must be at least 1",
            ));
        }
        if self.shell.timeout_secs == 0 {
            return Err(TetradError::invalid_config(
                "shell.timeout_secs",
                "must be at least 1",
            ));
        }
        for (i, rule) in self.policy.rules.iter().enumerate() {
            rule.validate()
                .map_err(|reason| TetradError::invalid_config(format!("policy.rules[{i}]"), reason))?;
        }
        Ok(())
    }
}

/// Deep-merge `overlay` into `base`: tables merge, arrays append, scalars replace.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (toml::Value::Array(base_array), toml::Value::Array(overlay_array)) => {
            base_array.extend(overlay_array);
        }
        (slot, value) => *slot = value,
    }
}
