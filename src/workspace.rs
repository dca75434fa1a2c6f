//! Workspace layout and path confinement.
//!
//! A [`Workspace`] is the directory agents are allowed to touch. Everything
//! tetrad itself owns (session file, snapshots, audit log) lives in the
//! control directory [`CONTROL_DIR`] under the workspace root, which the
//! safety policy never lets an agent modify.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::config::DEFAULT_CONFIG_TOML;
use crate::error::{Result, TetradError};

/// Name of the control-state directory inside the workspace.
pub const CONTROL_DIR: &str = ".tetrad";

/// Scratch directory agents may use freely.
pub const PLAYGROUND_DIR: &str = "playground";

/// Project configuration file name.
pub const CONFIG_FILE: &str = "tetrad.toml";

/// Marker written above the entries tetrad adds to `.gitignore`.
const GITIGNORE_HEADER: &str = "# tetrad control state and playground";

/// A path that has been checked to lie inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute path on disk.
    pub absolute: PathBuf,
    /// Path relative to the workspace root.
    pub relative: PathBuf,
}

impl ResolvedPath {
    /// Relative path rendered with forward slashes, as policy globs see it.
    #[must_use]
    pub fn display_relative(&self) -> String {
        let joined = self
            .relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if joined.is_empty() {
            ".".to_string()
        } else {
            joined
        }
    }
}

/// The workspace root and the directories tetrad derives from it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open an existing directory as a workspace.
    ///
    /// The root is canonicalized so that later containment checks compare
    /// like with like.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            TetradError::config_with_path(
                format!("workspace root is not accessible: {e}"),
                root.to_path_buf(),
            )
        })?;
        if !canonical.is_dir() {
            return Err(TetradError::config_with_path(
                "workspace root is not a directory",
                canonical,
            ));
        }
        Ok(Self { root: canonical })
    }

    /// Workspace root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Control-state directory.
    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// Directory holding snapshot index and blobs.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.control_dir().join("snapshots")
    }

    /// Audit log file.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.control_dir().join("audit.jsonl")
    }

    /// Project configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Resolve an agent-supplied path and confirm it stays inside the root.
    ///
    /// Relative paths are taken from the root. `..` components are folded
    /// lexically, then the deepest existing ancestor is canonicalized so a
    /// symlink cannot smuggle the path out. The returned paths are the
    /// canonical ones, so a link such as `ctl -> .tetrad` resolves to the
    /// control directory it points at.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath> {
        let outside = || TetradError::OutsideWorkspace {
            path: raw.to_string(),
        };

        if raw.trim().is_empty() {
            return Err(outside());
        }

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize_lexically(&joined).ok_or_else(outside)?;

        if !normalized.starts_with(&self.root) {
            return Err(outside());
        }

        // symlink_metadata so a dangling link is treated as existing and
        // fails canonicalization instead of being written through
        let mut existing = normalized.as_path();
        while fs::symlink_metadata(existing).is_err() {
            existing = match existing.parent() {
                Some(parent) => parent,
                None => return Err(outside()),
            };
        }
        let canonical_ancestor = existing.canonicalize().map_err(|_| outside())?;
        if !canonical_ancestor.starts_with(&self.root) {
            return Err(outside());
        }

        let remainder = normalized.strip_prefix(existing).map_err(|_| outside())?;
        let absolute = if remainder.as_os_str().is_empty() {
            canonical_ancestor
        } else {
            canonical_ancestor.join(remainder)
        };
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| outside())?
            .to_path_buf();

        Ok(ResolvedPath { absolute, relative })
    }

    /// Check whether a workspace-relative path is inside the control directory.
    #[must_use]
    pub fn is_control_path(relative: &Path) -> bool {
        matches!(
            relative.components().next(),
            Some(Component::Normal(first)) if first == CONTROL_DIR
        )
    }
}

/// Fold `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` would climb above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// What `init` created or updated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub gitignore_entries_added: Vec<String>,
    pub config_written: bool,
}

/// Prepare a workspace: control and playground directories, `.gitignore`
/// entries, and a default `tetrad.toml`.
///
/// Re-running is safe; existing entries are never duplicated and an
/// existing config is only replaced with `force`.
pub fn init(workspace: &Workspace, force: bool) -> Result<InitReport> {
    let mut report = InitReport::default();

    for dir in [workspace.control_dir(), workspace.root().join(PLAYGROUND_DIR)] {
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!("Created directory {}", dir.display());
            report.created_dirs.push(dir);
        }
    }

    let gitignore = workspace.root().join(".gitignore");
    let wanted = [format!("{CONTROL_DIR}/"), format!("{PLAYGROUND_DIR}/")];
    let existing = if gitignore.exists() {
        fs::read_to_string(&gitignore)?
    } else {
        String::new()
    };
    let missing: Vec<String> = wanted
        .iter()
        .filter(|entry| !existing.lines().any(|line| line.trim() == entry.as_str()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{GITIGNORE_HEADER}")?;
        for entry in &missing {
            writeln!(file, "{entry}")?;
        }
        debug!("Added {:?} to {}", missing, gitignore.display());
        report.gitignore_entries_added = missing;
    }

    let config_path = workspace.config_path();
    if force || !config_path.exists() {
        fs::write(&config_path, DEFAULT_CONFIG_TOML)?;
        report.config_written = true;
    }

    Ok(report)
}
