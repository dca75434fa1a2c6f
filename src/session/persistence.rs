//! Durable storage of the session record.
//!
//! `.tetrad/session.json` is replaced with write-to-temp, fsync, rename, so
//! a crash leaves either the previous record or the new one. A sidecar lock
//! file serializes writers against readers.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::{SessionState, SESSION_STATE_VERSION};
use crate::error::{Result, TetradError};

const FILE_NAME: &str = "session.json";

/// Holds an advisory lock until dropped.
struct LockGuard(File);

impl LockGuard {
    fn exclusive(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        file.lock_exclusive()?;
        Ok(Self(file))
    }

    /// Shared lock, or `None` when no writer ever created the lock file.
    fn shared(path: &Path) -> std::io::Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => {
                file.lock_shared()?;
                Ok(Some(Self(file)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Reads and writes the session record in a control directory.
///
/// Every failure surfaces as [`TetradError::Persistence`], which the
/// scheduler treats as fatal.
#[derive(Debug, Clone)]
pub struct SessionPersistence {
    dir: PathBuf,
}

impl SessionPersistence {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn session_file_path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{FILE_NAME}.{suffix}"))
    }

    /// Staging file renamed over the record on save.
    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    /// Replace the record with `state`.
    ///
    /// The state is written exactly as given; callers bump the revision
    /// with [`SessionState::touch`] before saving a new decision.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let target = self.session_file_path();
        let fail = |e: std::io::Error| TetradError::persistence(&target, e.to_string());

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| TetradError::persistence(&target, e.to_string()))?;

        fs::create_dir_all(&self.dir).map_err(fail)?;
        let _lock = LockGuard::exclusive(&self.lock_file_path()).map_err(fail)?;

        let staging = self.tmp_file_path();
        let mut file = File::create(&staging).map_err(fail)?;
        file.write_all(&json)
            .and_then(|()| file.sync_all())
            .and_then(|()| fs::rename(&staging, &target))
            .map_err(fail)?;

        debug!(revision = state.metadata.revision, "Session state saved");
        Ok(())
    }

    /// Read the record, or `Ok(None)` when there is none.
    ///
    /// A file that does not parse is moved aside to `session.json.corrupt`
    /// and reported; it is never deleted.
    pub fn load(&self) -> Result<Option<SessionState>> {
        let source = self.session_file_path();
        let fail = |message: String| TetradError::persistence(&source, message);

        let contents = {
            let _lock = LockGuard::shared(&self.lock_file_path()).map_err(|e| fail(e.to_string()))?;
            match fs::read_to_string(&source) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(fail(e.to_string())),
            }
        };

        let state: SessionState = serde_json::from_str(&contents).map_err(|e| {
            let quarantine = self.sibling("corrupt");
            warn!(
                "Session file {} does not parse ({e}); moving it to {}",
                source.display(),
                quarantine.display()
            );
            let _ = fs::rename(&source, &quarantine);
            fail(format!("session file is corrupt ({e}); moved to {}", quarantine.display()))
        })?;

        if !state.is_version_compatible() {
            return Err(fail(format!(
                "session version {} is not supported (expected {SESSION_STATE_VERSION})",
                state.version()
            )));
        }

        Ok(Some(state))
    }

    /// Like [`load`](Self::load), but a missing record is [`TetradError::NoSession`].
    pub fn load_required(&self) -> Result<SessionState> {
        self.load()?.ok_or_else(|| TetradError::NoSession {
            dir: self.dir.clone(),
        })
    }

    pub fn delete(&self) -> Result<()> {
        let target = self.session_file_path();
        match fs::remove_file(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(TetradError::persistence(&target, e.to_string()))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.session_file_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::task::TaskStatus;
    use tempfile::TempDir;

    fn store() -> (SessionPersistence, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let persistence = SessionPersistence::new(temp_dir.path().join(".tetrad"));
        (persistence, temp_dir)
    }

    fn sample_state() -> SessionState {
        SessionState::new("goal", SessionSettings::default(), ["a", "b"])
    }

    #[test]
    fn test_save_creates_file() {
        let (persistence, _temp_dir) = store();
        assert!(!persistence.exists());
        persistence.save(&sample_state()).unwrap();
        assert!(persistence.exists());
    }

    #[test]
    fn test_load_returns_none_when_missing() {
        let (persistence, _temp_dir) = store();
        assert!(persistence.load().unwrap().is_none());
        assert!(matches!(
            persistence.load_required(),
            Err(TetradError::NoSession { .. })
        ));
    }

    #[test]
    fn test_in_review_state_survives_reload() {
        let (persistence, _temp_dir) = store();

        let mut state = sample_state();
        state.active_index = Some(0);
        state.tasks[0].status = TaskStatus::InReview;
        state.tasks[0].iteration = 3;
        state.touch();

        persistence.save(&state).unwrap();
        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_parked_and_escalated_state_survives_reload() {
        use crate::approval::PendingApproval;
        use crate::driver::{OutcomeTag, Role};
        use crate::task::{AttemptOutcome, AttemptRecord, EscalationReason};
        use crate::tools::{Action, ActionRecord, ActionStatus, ApprovedBy};
        use chrono::Utc;
        use serde_json::json;

        let (persistence, _temp_dir) = store();
        let mut state = SessionState::new("goal", SessionSettings::default(), ["a", "b", "c"]);

        state.tasks[0].status = TaskStatus::Escalated;
        state.tasks[0].iteration = 5;
        state.tasks[0].escalation = Some(EscalationReason::IterationCeiling { ceiling: 5 });
        state.tasks[0].attempts.push(AttemptRecord {
            sequence: 1,
            role: Some(Role::Reviewer),
            recorded_at: Utc::now(),
            outcome: AttemptOutcome::Rejected,
            notes: Some(json!({ "defects": ["off by one"] })),
            actions: Vec::new(),
            status_before: TaskStatus::InReview,
            status_after: TaskStatus::Escalated,
            iteration_after: 5,
        });

        let executed = ActionRecord {
            action: Action::Read { path: "src/lib.rs".into() },
            status: ActionStatus::Executed {
                approved_by: ApprovedBy::Policy,
                output: "fn main() {}".into(),
            },
        };
        let denied = ActionRecord {
            action: Action::ExecuteShell {
                command: "git push".into(),
            },
            status: ActionStatus::Denied {
                reason: "not yet".into(),
            },
        };
        state.tasks[1].status = TaskStatus::Active;
        state.tasks[1].consecutive_denials = 1;
        state.tasks[1].attempts.push(AttemptRecord {
            sequence: 1,
            role: Some(Role::Implementer),
            recorded_at: Utc::now(),
            outcome: AttemptOutcome::PolicyDenied {
                reason: "not yet".into(),
            },
            notes: Some(json!("tried to publish")),
            actions: vec![executed.clone(), denied],
            status_before: TaskStatus::Active,
            status_after: TaskStatus::Active,
            iteration_after: 0,
        });
        state.active_index = Some(1);
        state.pending_approval = Some(PendingApproval {
            token: PendingApproval::new_token(),
            task_id: "task-2".into(),
            role: Role::Implementer,
            action: Action::Write {
                path: "src/lib.rs".into(),
                content: "pub fn f() {}\n".into(),
            },
            rule: "default: write -> require_confirmation".into(),
            outcome: OutcomeTag::Approve,
            notes: Some(json!({ "summary": "second try" })),
            completed: vec![executed],
            remaining: vec![Action::ExecuteShell {
                command: "cargo test".into(),
            }],
            created_at: Utc::now(),
        });
        state.touch();

        persistence.save(&state).unwrap();
        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_staging_file_is_renamed_away() {
        let (persistence, _temp_dir) = store();
        persistence.save(&sample_state()).unwrap();
        assert!(!persistence.tmp_file_path().exists());
        assert!(persistence.lock_file_path().exists());
    }

    #[test]
    fn test_corrupt_file_is_quarantined_not_deleted() {
        let (persistence, temp_dir) = store();
        fs::create_dir_all(temp_dir.path().join(".tetrad")).unwrap();
        fs::write(persistence.session_file_path(), "{ not json").unwrap();

        let err = persistence.load().unwrap_err();
        assert!(err.is_fatal());
        assert!(!persistence.exists());
        let quarantined = temp_dir.path().join(".tetrad/session.json.corrupt");
        assert_eq!(fs::read_to_string(quarantined).unwrap(), "{ not json");
    }

    #[test]
    fn test_incompatible_version_is_refused() {
        let (persistence, _temp_dir) = store();
        let mut state = sample_state();
        state.metadata.version = SESSION_STATE_VERSION + 1;
        persistence.save(&state).unwrap();

        assert!(persistence.load().is_err());
        assert!(persistence.exists());
    }

    #[test]
    fn test_delete() {
        let (persistence, _temp_dir) = store();
        persistence.save(&sample_state()).unwrap();
        persistence.delete().unwrap();
        assert!(!persistence.exists());
        persistence.delete().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_save_into_unwritable_dir_is_persistence_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        // a regular file where the directory should be
        let persistence = SessionPersistence::new(blocker.join("nested"));
        let err = persistence.save(&sample_state()).unwrap_err();
        assert!(matches!(err, TetradError::Persistence { .. }));
    }
}
