//! File operations behind the read, write, insert and search actions.
//!
//! Writes go to a sibling temporary file that is renamed over the target,
//! so a crash never leaves a half-written file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use ignore::WalkBuilder;

use crate::error::{Result, TetradError};
use crate::workspace::CONTROL_DIR;

/// Directories search never descends into.
const SEARCH_SKIP_DIRS: &[&str] = &[".git", CONTROL_DIR, "node_modules", "target", "__pycache__"];

/// Maximum number of hits a search returns.
pub const MAX_SEARCH_HITS: usize = 200;

/// Read a UTF-8 text file.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| TetradError::tool("read", format!("{}: {e}", path.display())))?;
    String::from_utf8(bytes)
        .map_err(|_| TetradError::tool("read", format!("{} is not valid UTF-8", path.display())))
}

/// Replace `path` with `bytes` via write-to-temp-then-rename.
///
/// Parent directories are created as needed. An existing target keeps its
/// permissions.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TetradError::tool("write", format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let permissions = fs::metadata(path).ok().map(|m| m.permissions());

    let result = (|| -> std::io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        if let Some(permissions) = permissions {
            tmp.set_permissions(permissions)?;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Compute the content of `original` with `content` inserted before `line`.
///
/// Lines are 1-based; `len + 1` appends. Anything else is out of range.
pub fn insert_lines(original: &str, line: usize, content: &str, display_path: &str) -> Result<String> {
    let lines: Vec<&str> = original.split_inclusive('\n').collect();
    let len = lines.len();
    if line == 0 || line > len + 1 {
        return Err(TetradError::LineOutOfRange {
            path: display_path.to_string(),
            line,
            len,
        });
    }

    let mut inserted = content.to_string();
    if !inserted.ends_with('\n') {
        inserted.push('\n');
    }

    let mut out = String::with_capacity(original.len() + inserted.len() + 1);
    for chunk in &lines[..line - 1] {
        out.push_str(chunk);
    }
    if line - 1 == len && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&inserted);
    for chunk in &lines[line - 1..] {
        out.push_str(chunk);
    }
    Ok(out)
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Path relative to the workspace root.
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Literal substring search under `base`, honoring `.gitignore`.
///
/// Binary and unreadable files are skipped silently.
pub fn search(root: &Path, base: &Path, query: &str, max_hits: usize) -> Result<Vec<SearchHit>> {
    if query.is_empty() {
        return Err(TetradError::tool("search", "query must not be empty"));
    }

    let walker = WalkBuilder::new(base)
        .hidden(false)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_some_and(|t| t.is_dir()) && SEARCH_SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();

    let mut hits = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        for (i, line) in content.lines().enumerate() {
            if line.contains(query) {
                hits.push(SearchHit {
                    path: relative.clone(),
                    line: i + 1,
                    text: line.trim().to_string(),
                });
                if hits.len() >= max_hits {
                    return Ok(hits);
                }
            }
        }
    }

    hits.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
    Ok(hits)
}

/// Render hits the way agents expect them: `path:line: text`.
#[must_use]
pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No matches found.".to_string();
    }
    hits.iter()
        .map(|h| format!("{}:{}: {}", h.path, h.line, h.text))
        .collect::<Vec<_>>()
        .join("\n")
}
