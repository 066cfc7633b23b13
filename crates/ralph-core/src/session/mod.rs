//! Durable session records with crash detection and resume.
//!
//! One JSON file per session under the session directory, plus an
//! `index.json` carrying the single active-session pointer. Session
//! writes go through a temp file + rename so a crash never leaves a
//! half-written record. A session left `running` on disk whose recorded
//! pid no longer exists is reclassified as `crashed` the next time the
//! manager scans the directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("another session '{0}' is already running")]
    AlreadyActive(String),

    #[error("session I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse session file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Crashed,
    Aborted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Crashed => write!(f, "crashed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Git state captured when the session starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    pub branch: String,
    pub commit_hash: String,
}

/// Error record captured by `mark_crashed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of one factory worker, persisted for `status` rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: usize,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
}

/// One run of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    /// Snapshot of the run configuration at creation time.
    pub config: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub current_iteration: u32,
    pub completed_task_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    pub git_state: GitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<CrashInfo>,
    /// Supervisor pid, used for crash detection across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tasks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub task_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_session: Option<String>,
    #[serde(default)]
    sessions: Vec<IndexEntry>,
}

/// Exclusive owner of the session directory.
#[derive(Debug)]
pub struct SessionManager {
    dir: PathBuf,
    current: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SessionError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new session and make it the active one.
    ///
    /// Reclassifies stale `running` sessions first; fails if a live one
    /// still holds the active pointer.
    pub fn create_session(
        &self,
        config: serde_json::Value,
        branch: &str,
        commit: &str,
    ) -> Result<Session, SessionError> {
        self.detect_crashes()?;

        let mut index = self.load_index();
        if let Some(ref active) = index.active_session {
            if let Ok(session) = self.load_session(active) {
                if session.status == SessionStatus::Running {
                    return Err(SessionError::AlreadyActive(active.clone()));
                }
            }
        }

        let now = Utc::now();
        let session = Session {
            session_id: new_session_id(),
            status: SessionStatus::Running,
            config,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
            current_iteration: 0,
            completed_task_count: 0,
            current_task: None,
            completed_tasks: Vec::new(),
            git_state: GitState {
                branch: branch.to_string(),
                commit_hash: commit.to_string(),
            },
            last_error: None,
            pid: Some(std::process::id()),
            workers: None,
            active_tasks: None,
        };

        self.write_session(&session)?;
        index.active_session = Some(session.session_id.clone());
        index.sessions.push(IndexEntry {
            session_id: session.session_id.clone(),
            started_at: session.started_at,
            status: session.status,
            task_count: 0,
        });
        self.write_index(&index)?;

        *self.lock_current() = Some(session.clone());
        tracing::info!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// Adopt an existing session object as the current one (resume path).
    pub fn set_current_session(&self, session: Session) {
        *self.lock_current() = Some(session);
    }

    pub fn current_session(&self) -> Option<Session> {
        self.lock_current().clone()
    }

    /// Record that a task was dispatched.
    pub fn start_task(&self, task_id: &str) -> Result<(), SessionError> {
        self.update_current(|s| {
            s.current_task = Some(task_id.to_string());
            s.last_activity_at = Utc::now();
        })
        .map(|_| ())
    }

    /// Record that the current task completed.
    pub fn complete_task(&self, task_id: &str) -> Result<(), SessionError> {
        self.update_current(|s| {
            if s.current_task.as_deref() == Some(task_id) {
                s.current_task = None;
            }
            s.completed_tasks.push(task_id.to_string());
            s.completed_task_count += 1;
            s.last_activity_at = Utc::now();
        })
        .map(|_| ())
    }

    pub fn set_iteration(&self, iteration: u32) -> Result<(), SessionError> {
        self.update_current(|s| {
            s.current_iteration = iteration;
            s.last_activity_at = Utc::now();
        })
        .map(|_| ())
    }

    /// Persist factory worker snapshots and the in-flight task set.
    pub fn set_factory_state(
        &self,
        workers: Vec<WorkerSnapshot>,
        active_tasks: Vec<String>,
    ) -> Result<(), SessionError> {
        self.update_current(|s| {
            s.workers = Some(workers);
            s.active_tasks = Some(active_tasks);
            s.last_activity_at = Utc::now();
        })
        .map(|_| ())
    }

    /// Mark the current session completed and clear the active pointer.
    pub fn complete_session(&self) -> Result<(), SessionError> {
        let id = self.update_current(|s| {
            s.status = SessionStatus::Completed;
            s.completed_at = Some(Utc::now());
            s.current_task = None;
            s.last_activity_at = Utc::now();
        })?;
        self.update_index(|index| {
            if index.active_session.as_deref() == Some(id.as_str()) {
                index.active_session = None;
            }
        })
    }

    /// Record a supervisor crash. The active pointer is preserved so the
    /// session can be resumed.
    pub fn mark_crashed(&self, message: &str, stack: Option<String>) -> Result<(), SessionError> {
        self.update_current(|s| {
            s.status = SessionStatus::Crashed;
            s.last_error = Some(CrashInfo {
                message: message.to_string(),
                stack,
                timestamp: Utc::now(),
            });
            s.last_activity_at = Utc::now();
        })?;
        Ok(())
    }

    /// Abort a session (the given one, or the active one). Idempotent:
    /// aborting an already-aborted or missing session is a no-op.
    pub fn abort_session(&self, id: Option<&str>) -> Result<Option<String>, SessionError> {
        let target = match id {
            Some(id) => Some(id.to_string()),
            None => self.load_index().active_session,
        };
        let Some(target) = target else {
            return Ok(None);
        };
        let Ok(mut session) = self.load_session(&target) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Aborted {
            session.status = SessionStatus::Aborted;
            session.completed_at = Some(Utc::now());
            session.last_activity_at = Utc::now();
            self.write_session(&session)?;
        }
        self.update_index(|index| {
            if index.active_session.as_deref() == Some(target.as_str()) {
                index.active_session = None;
            }
        })?;
        Ok(Some(target))
    }

    pub fn load_session(&self, id: &str) -> Result<Session, SessionError> {
        let path = self.session_path(id);
        let contents = std::fs::read_to_string(&path).map_err(|_| {
            SessionError::NotFound(id.to_string())
        })?;
        serde_json::from_str(&contents).map_err(|e| SessionError::Parse { path, source: e })
    }

    /// The session the active pointer references, if any.
    pub fn active_session(&self) -> Option<Session> {
        let index = self.load_index();
        let id = index.active_session?;
        self.load_session(&id).ok()
    }

    /// List known sessions, newest first, with statuses refreshed from
    /// the individual session files.
    pub fn list_sessions(&self) -> Result<Vec<IndexEntry>, SessionError> {
        self.detect_crashes()?;
        let mut entries = self.load_index().sessions;
        for entry in &mut entries {
            if let Ok(session) = self.load_session(&entry.session_id) {
                entry.status = session.status;
                entry.task_count = session.completed_task_count;
            }
        }
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(entries)
    }

    /// Remove session files older than `days` whose status is not
    /// `running`. Returns the removed session ids.
    pub fn cleanup(&self, days: i64) -> Result<Vec<String>, SessionError> {
        self.detect_crashes()?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut removed = Vec::new();

        let index = self.load_index();
        for entry in &index.sessions {
            let Ok(session) = self.load_session(&entry.session_id) else {
                continue;
            };
            if session.status != SessionStatus::Running && session.started_at < cutoff {
                let path = self.session_path(&session.session_id);
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove session file");
                } else {
                    removed.push(session.session_id.clone());
                }
            }
        }

        if !removed.is_empty() {
            self.update_index(|index| {
                index
                    .sessions
                    .retain(|e| !removed.contains(&e.session_id));
            })?;
        }
        Ok(removed)
    }

    /// The task a crashed session was working on when it died.
    pub fn get_orphaned_task(&self, id: &str) -> Result<Option<String>, SessionError> {
        self.detect_crashes()?;
        let session = self.load_session(id)?;
        match session.status {
            SessionStatus::Crashed => Ok(session.current_task),
            _ => Ok(None),
        }
    }

    /// Reopen a crashed session: set it back to `running`, point the
    /// active pointer at it, and hand back the orphaned task (if any)
    /// for re-dispatch.
    pub fn resume_session(&self, id: &str) -> Result<(Session, Option<String>), SessionError> {
        self.detect_crashes()?;
        let mut session = self.load_session(id)?;
        let orphaned = match session.status {
            SessionStatus::Crashed | SessionStatus::Running => session.current_task.clone(),
            _ => None,
        };
        session.status = SessionStatus::Running;
        session.pid = Some(std::process::id());
        session.current_task = None;
        session.last_activity_at = Utc::now();
        self.write_session(&session)?;
        self.update_index(|index| {
            index.active_session = Some(session.session_id.clone());
        })?;
        *self.lock_current() = Some(session.clone());
        tracing::info!(session_id = %id, orphaned = ?orphaned, "session resumed");
        Ok((session, orphaned))
    }

    /// Scan for sessions recorded as `running` whose pid is gone and
    /// reclassify them as `crashed`. The active pointer is left in place
    /// so `resume` still works.
    pub fn detect_crashes(&self) -> Result<(), SessionError> {
        let index = self.load_index();
        for entry in &index.sessions {
            let Ok(mut session) = self.load_session(&entry.session_id) else {
                continue;
            };
            if session.status != SessionStatus::Running {
                continue;
            }
            let alive = session
                .pid
                .is_some_and(|pid| pid == std::process::id() || pid_alive(pid));
            if !alive {
                tracing::warn!(
                    session_id = %session.session_id,
                    pid = ?session.pid,
                    "running session has no live process; marking crashed"
                );
                session.status = SessionStatus::Crashed;
                session.last_error = Some(CrashInfo {
                    message: "process exited without completing the session".to_string(),
                    stack: None,
                    timestamp: Utc::now(),
                });
                self.write_session(&session)?;
            }
        }
        Ok(())
    }

    // -- internals -----------------------------------------------------

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn load_index(&self) -> SessionIndex {
        let path = self.index_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => SessionIndex::default(),
        }
    }

    fn write_index(&self, index: &SessionIndex) -> Result<(), SessionError> {
        atomic_write_json(&self.index_path(), index)
    }

    fn update_index(
        &self,
        mutate: impl FnOnce(&mut SessionIndex),
    ) -> Result<(), SessionError> {
        let mut index = self.load_index();
        mutate(&mut index);
        self.write_index(&index)
    }

    fn write_session(&self, session: &Session) -> Result<(), SessionError> {
        atomic_write_json(&self.session_path(&session.session_id), session)
    }

    /// Apply a mutation to the in-memory current session and persist it.
    /// Returns the session id.
    fn update_current(&self, mutate: impl FnOnce(&mut Session)) -> Result<String, SessionError> {
        let mut guard = self.lock_current();
        let Some(session) = guard.as_mut() else {
            return Err(SessionError::NotFound("<no current session>".to_string()));
        };
        mutate(session);
        let snapshot = session.clone();
        drop(guard);
        self.write_session(&snapshot)?;
        Ok(snapshot.session_id)
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Atomic JSON write: temp file in the same directory, then rename.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionError> {
    let serialized = serde_json::to_string_pretty(value).map_err(|e| SessionError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serialized).map_err(|e| SessionError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| SessionError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// 8-char opaque session id.
fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything. EPERM
    // still means the process exists.
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
