//! Pre-write backups and per-task undo.
//!
//! Before an approved write touches a file, the [`SnapshotStore`] records
//! what the file looked like: its bytes (stored content-addressed under
//! `blobs/<sha256>`) or the fact that it did not exist. `undo(task_id)`
//! replays those records newest first, so a path written several times ends
//! up with the bytes it had before the task's first write.
//!
//! ```text
//! .tetrad/snapshots/
//!   ├── index.json        ordered snapshot records
//!   └── blobs/<sha256>    pre-write contents, shared between records
//! ```
//!
//! Edits made to the same paths outside tetrad are not tracked; undo
//! restores the captured bytes regardless.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, TetradError};
use crate::tools::files::write_atomic;
use crate::workspace::{ResolvedPath, Workspace};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const INDEX_VERSION: u32 = 1;

/// What a path held before the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PriorState {
    /// The path did not exist; undo deletes it.
    Absent,
    /// The path held these bytes.
    Present { digest: String, len: u64 },
}

/// A single pre-write capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub task_id: String,
    /// Workspace-relative path with forward slashes.
    pub path: String,
    pub before: PriorState,
    pub taken_at: DateTime<Utc>,
    /// Store-wide capture order.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotIndex {
    version: u32,
    next_sequence: u64,
    snapshots: Vec<Snapshot>,
}

impl Default for SnapshotIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_sequence: 1,
            snapshots: Vec::new(),
        }
    }
}

/// Outcome of an undo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoReport {
    /// Paths whose previous bytes were written back.
    pub restored: Vec<String>,
    /// Paths that did not exist before and were removed.
    pub removed: Vec<String>,
}

impl UndoReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty() && self.removed.is_empty()
    }
}

/// Content-addressed backup store rooted in the control directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    root: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(workspace: &Workspace) -> Self {
        Self::open(workspace.snapshot_dir(), workspace.root())
    }

    /// Store at `dir` restoring paths relative to `root`.
    #[must_use]
    pub fn open(dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            root: root.into(),
        }
    }

    /// Record the current state of `target` on behalf of `task_id`.
    pub fn capture(&self, task_id: &str, target: &ResolvedPath) -> Result<Snapshot> {
        let before = if target.absolute.is_file() {
            let bytes = fs::read(&target.absolute).map_err(|e| {
                TetradError::snapshot(format!("cannot read {}: {e}", target.absolute.display()))
            })?;
            let digest = hex::encode(Sha256::digest(&bytes));
            let blob = self.blob_path(&digest);
            if !blob.exists() {
                write_atomic(&blob, &bytes)?;
            }
            PriorState::Present {
                digest,
                len: bytes.len() as u64,
            }
        } else if target.absolute.exists() {
            return Err(TetradError::snapshot(format!(
                "{} is not a regular file",
                target.display_relative()
            )));
        } else {
            PriorState::Absent
        };

        let mut index = self.load_index()?;
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            path: target.display_relative(),
            before,
            taken_at: Utc::now(),
            sequence: index.next_sequence,
        };
        index.next_sequence += 1;
        index.snapshots.push(snapshot.clone());
        self.save_index(&index)?;

        debug!(task_id, path = %snapshot.path, "Captured snapshot");
        Ok(snapshot)
    }

    /// Snapshots recorded for a task, oldest first.
    pub fn snapshots_for(&self, task_id: &str) -> Result<Vec<Snapshot>> {
        let index = self.load_index()?;
        Ok(index
            .snapshots
            .into_iter()
            .filter(|s| s.task_id == task_id)
            .collect())
    }

    /// Restore every path the task wrote, newest capture first, then drop
    /// the task's records. A task without records is a no-op.
    pub fn undo(&self, task_id: &str) -> Result<UndoReport> {
        let mut index = self.load_index()?;
        let mut mine: Vec<Snapshot> = index
            .snapshots
            .iter()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        if mine.is_empty() {
            debug!(task_id, "Nothing to undo");
            return Ok(UndoReport::default());
        }
        mine.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let mut report = UndoReport::default();
        for snapshot in &mine {
            let target = self.root.join(&snapshot.path);
            match &snapshot.before {
                PriorState::Present { digest, .. } => {
                    let bytes = self.read_blob(digest)?;
                    write_atomic(&target, &bytes)?;
                    push_unique(&mut report.restored, &snapshot.path);
                    report.removed.retain(|p| p != &snapshot.path);
                }
                PriorState::Absent => {
                    if target.is_file() {
                        fs::remove_file(&target)?;
                    }
                    push_unique(&mut report.removed, &snapshot.path);
                    report.restored.retain(|p| p != &snapshot.path);
                }
            }
        }

        index.snapshots.retain(|s| s.task_id != task_id);
        self.save_index(&index)?;
        self.collect_garbage(&index)?;

        info!(
            task_id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            "Undo complete"
        );
        Ok(report)
    }

    /// Forget a task's snapshots without restoring anything.
    pub fn prune(&self, task_id: &str) -> Result<usize> {
        let mut index = self.load_index()?;
        let before = index.snapshots.len();
        index.snapshots.retain(|s| s.task_id != task_id);
        let pruned = before - index.snapshots.len();
        if pruned > 0 {
            self.save_index(&index)?;
            self.collect_garbage(&index)?;
        }
        Ok(pruned)
    }

    /// Forget every snapshot.
    pub fn prune_all(&self) -> Result<usize> {
        let mut index = self.load_index()?;
        let pruned = index.snapshots.len();
        index.snapshots.clear();
        self.save_index(&index)?;
        self.collect_garbage(&index)?;
        Ok(pruned)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.dir.join(BLOB_DIR).join(digest)
    }

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let bytes = fs::read(&path)
            .map_err(|e| TetradError::snapshot(format!("missing blob {digest}: {e}")))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != digest {
            return Err(TetradError::snapshot(format!(
                "blob {digest} is corrupt (content hashes to {actual})"
            )));
        }
        Ok(bytes)
    }

    fn load_index(&self) -> Result<SnapshotIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(SnapshotIndex::default());
        }
        let content = fs::read_to_string(&path)?;
        let index: SnapshotIndex = serde_json::from_str(&content)
            .map_err(|e| TetradError::snapshot(format!("unreadable index {}: {e}", path.display())))?;
        if index.version != INDEX_VERSION {
            return Err(TetradError::snapshot(format!(
                "unsupported index version {}",
                index.version
            )));
        }
        Ok(index)
    }

    fn save_index(&self, index: &SnapshotIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(), &json)
    }

    /// Delete blobs no remaining record refers to.
    fn collect_garbage(&self, index: &SnapshotIndex) -> Result<()> {
        let blob_dir = self.dir.join(BLOB_DIR);
        if !blob_dir.is_dir() {
            return Ok(());
        }
        let live: HashSet<&str> = index
            .snapshots
            .iter()
            .filter_map(|s| match &s.before {
                PriorState::Present { digest, .. } => Some(digest.as_str()),
                PriorState::Absent => None,
            })
            .collect();

        for entry in fs::read_dir(&blob_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live.contains(name.as_str()) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("Could not remove unused blob {name}: {e}");
                }
            }
        }
        Ok(())
    }

    /// Directory the store lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn push_unique(list: &mut Vec<String>, path: &str) {
    if !list.iter().any(|p| p == path) {
        list.push(path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (SnapshotStore, Workspace, TempDir) {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        (SnapshotStore::new(&ws), ws, temp)
    }

    fn write_through(store: &SnapshotStore, ws: &Workspace, task: &str, path: &str, bytes: &[u8]) {
        let resolved = ws.resolve(path).unwrap();
        store.capture(task, &resolved).unwrap();
        write_atomic(&resolved.absolute, bytes).unwrap();
    }

    #[test]
    fn test_capture_existing_file_stores_blob() {
        let (store, ws, _temp) = store();
        fs::write(ws.root().join("a.txt"), b"original").unwrap();

        let snapshot = store.capture("task-1", &ws.resolve("a.txt").unwrap()).unwrap();
        match &snapshot.before {
            PriorState::Present { digest, len } => {
                assert_eq!(*len, 8);
                assert!(store.blob_path(digest).exists());
            }
            PriorState::Absent => panic!("expected present"),
        }
        assert_eq!(snapshot.path, "a.txt");
        assert_eq!(store.snapshots_for("task-1").unwrap().len(), 1);
    }

    #[test]
    fn test_undo_restores_exact_bytes() {
        let (store, ws, _temp) = store();
        let original = b"line one\r\nline two\x00\xff".to_vec();
        fs::write(ws.root().join("data.bin"), &original).unwrap();

        write_through(&store, &ws, "task-1", "data.bin", b"first edit");
        write_through(&store, &ws, "task-1", "data.bin", b"second edit");

        let report = store.undo("task-1").unwrap();
        assert_eq!(report.restored, vec!["data.bin".to_string()]);
        assert_eq!(fs::read(ws.root().join("data.bin")).unwrap(), original);
    }

    #[test]
    fn test_undo_removes_created_files() {
        let (store, ws, _temp) = store();
        write_through(&store, &ws, "task-1", "src/new.rs", b"fn main() {}");
        assert!(ws.root().join("src/new.rs").exists());

        let report = store.undo("task-1").unwrap();
        assert_eq!(report.removed, vec!["src/new.rs".to_string()]);
        assert!(!ws.root().join("src/new.rs").exists());
    }

    #[test]
    fn test_undo_twice_is_noop() {
        let (store, ws, _temp) = store();
        fs::write(ws.root().join("a.txt"), b"v1").unwrap();
        write_through(&store, &ws, "task-1", "a.txt", b"v2");

        store.undo("task-1").unwrap();
        fs::write(ws.root().join("a.txt"), b"edited by hand").unwrap();

        let second = store.undo("task-1").unwrap();
        assert!(second.is_empty());
        assert_eq!(fs::read(ws.root().join("a.txt")).unwrap(), b"edited by hand");
    }

    #[test]
    fn test_undo_unknown_task_is_noop() {
        let (store, _ws, _temp) = store();
        assert!(store.undo("task-9").unwrap().is_empty());
    }

    #[test]
    fn test_undo_only_touches_own_task() {
        let (store, ws, _temp) = store();
        fs::write(ws.root().join("shared.txt"), b"base").unwrap();
        write_through(&store, &ws, "task-1", "one.txt", b"1");
        write_through(&store, &ws, "task-2", "two.txt", b"2");

        store.undo("task-1").unwrap();
        assert!(!ws.root().join("one.txt").exists());
        assert!(ws.root().join("two.txt").exists());
        assert_eq!(store.snapshots_for("task-2").unwrap().len(), 1);
    }

    #[test]
    fn test_blobs_are_shared_and_collected() {
        let (store, ws, _temp) = store();
        fs::write(ws.root().join("a.txt"), b"same").unwrap();
        fs::write(ws.root().join("b.txt"), b"same").unwrap();
        write_through(&store, &ws, "task-1", "a.txt", b"x");
        write_through(&store, &ws, "task-2", "b.txt", b"y");

        let blob_count = || fs::read_dir(store.dir().join(BLOB_DIR)).unwrap().count();
        assert_eq!(blob_count(), 1);

        store.prune("task-1").unwrap();
        assert_eq!(blob_count(), 1);

        store.prune("task-2").unwrap();
        assert_eq!(blob_count(), 0);
    }

    #[test]
    fn test_prune_all() {
        let (store, ws, _temp) = store();
        write_through(&store, &ws, "task-1", "a.txt", b"x");
        write_through(&store, &ws, "task-2", "b.txt", b"y");
        assert_eq!(store.prune_all().unwrap(), 2);
        assert!(store.undo("task-1").unwrap().is_empty());
        assert!(ws.root().join("a.txt").exists());
    }

    #[test]
    fn test_capture_rejects_directory() {
        let (store, ws, _temp) = store();
        fs::create_dir_all(ws.root().join("dir")).unwrap();
        let err = store.capture("task-1", &ws.resolve("dir").unwrap()).unwrap_err();
        assert!(matches!(err, TetradError::Snapshot { .. }));
    }
}
