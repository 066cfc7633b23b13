//! The task source: mediates all reads and writes of PRD files.
//!
//! Loads tasks from one PRD file (override) or every `*.json` in a PRD
//! directory, builds the dependency DAG, and serves scheduling queries.
//! All status mutations go through the source; each mutation rewrites the
//! affected file in full with a refreshed `metadata.updated_at`. Write
//! errors are logged and the in-memory state stays authoritative; the
//! next successful write resynchronizes the file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;

use super::dag::{DagError, TaskDag};
use super::{PrdFile, PrdMetadata, Task, TaskFilter, TaskStatus, TaskSummary, TaskUpdate};
use crate::validate::ValidationResults;

/// Fatal initialization / mutation errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No readable PRD file was found.
    #[error("no PRD file found under {}", searched.display())]
    NoPrdFound { searched: PathBuf },

    /// The dependency graph is invalid (cycle or unknown dependency).
    #[error("invalid task graph: {0}")]
    DagInvalid(#[from] DagError),

    /// A mutation referenced a task id that is not loaded.
    #[error("unknown task id '{0}'")]
    UnknownTask(String),

    /// An illegal status transition was requested.
    #[error("task '{id}' is {status}, expected {expected}")]
    InvalidTransition {
        id: String,
        status: TaskStatus,
        expected: &'static str,
    },
}

/// Where to load PRD files from, and how strictly to validate them.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Single-file override; takes precedence over `prd_dir`.
    pub prd_file: Option<PathBuf>,
    /// Directory scanned for `*.json` PRD files.
    pub prd_dir: Option<PathBuf>,
    /// Downgrade missing dependencies from an error to a blocked task.
    pub lenient: bool,
}

/// One loaded PRD file: everything except the items, which live in the
/// DAG while the source is running.
#[derive(Debug)]
struct LoadedPrd {
    path: PathBuf,
    shell: PrdFile,
    /// Ids of the items belonging to this file, in file order.
    item_ids: Vec<String>,
}

#[derive(Debug)]
struct SourceState {
    dag: TaskDag,
    files: Vec<LoadedPrd>,
}

/// The exclusive owner of tasks on disk.
#[derive(Debug)]
pub struct TaskSource {
    state: Mutex<SourceState>,
}

impl TaskSource {
    /// Load tasks, build the DAG, and validate it.
    ///
    /// Unreadable or unparsable files degrade to "no PRD" for that file
    /// (logged and skipped); if nothing loads, the whole initialization
    /// fails with [`SourceError::NoPrdFound`]. Graph errors are fatal.
    pub fn initialize(options: &SourceOptions) -> Result<Self, SourceError> {
        let searched = options
            .prd_file
            .clone()
            .or_else(|| options.prd_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let paths = discover_prd_files(options);
        let mut files = Vec::new();
        let mut tasks: Vec<Task> = Vec::new();

        for path in paths {
            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable PRD file");
                    continue;
                }
            };
            let mut prd: PrdFile = match serde_json::from_str(&contents) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed PRD file");
                    continue;
                }
            };

            let file_index = files.len();
            let mut item_ids = Vec::with_capacity(prd.items.len());
            for mut task in prd.items.drain(..) {
                task.normalize();
                task.ordinal = tasks.len();
                task.source_file = file_index;
                item_ids.push(task.id.clone());
                tasks.push(task);
            }

            files.push(LoadedPrd {
                path,
                shell: prd,
                item_ids,
            });
        }

        if files.is_empty() {
            return Err(SourceError::NoPrdFound { searched });
        }

        let dag = TaskDag::build(tasks, options.lenient)?;

        tracing::info!(
            files = files.len(),
            tasks = dag.len(),
            "task source initialized"
        );

        Ok(Self {
            state: Mutex::new(SourceState { dag, files }),
        })
    }

    /// The first ready task in priority order matching the filter.
    pub fn get_next_task(&self, filter: &TaskFilter) -> Option<Task> {
        let state = self.lock();
        state.dag.ready_tasks(filter).first().map(|t| (*t).clone())
    }

    /// Every ready task matching the filter, in scheduling order.
    pub fn get_ready_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.lock();
        state
            .dag
            .ready_tasks(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshot of all loaded tasks in input order.
    pub fn list_tasks(&self) -> Vec<Task> {
        let state = self.lock();
        state.dag.iter().cloned().collect()
    }

    /// File-level provider override for the file a task came from.
    pub fn file_provider(&self, task_id: &str) -> Option<String> {
        let state = self.lock();
        let task = state.dag.get(task_id)?;
        state
            .files
            .get(task.source_file)
            .and_then(|f| f.shell.metadata.as_ref())
            .and_then(|m| m.provider.clone())
    }

    /// Transition a task `pending -> in_progress`.
    ///
    /// Verifies that every dependency is completed; dispatching a task
    /// whose parents are unfinished is a scheduler bug.
    pub fn mark_in_progress(&self, id: &str) -> Result<(), SourceError> {
        let mut state = self.lock();
        {
            let task = state
                .dag
                .get(id)
                .ok_or_else(|| SourceError::UnknownTask(id.to_string()))?;
            if task.status != TaskStatus::Pending {
                return Err(SourceError::InvalidTransition {
                    id: id.to_string(),
                    status: task.status,
                    expected: "pending",
                });
            }
            for dep in task.dependencies.clone() {
                let dep_status = state.dag.get(&dep).map(|d| d.status);
                if dep_status != Some(TaskStatus::Completed) {
                    return Err(SourceError::InvalidTransition {
                        id: dep,
                        status: dep_status.unwrap_or(TaskStatus::Blocked),
                        expected: "completed",
                    });
                }
            }
        }
        let task = state.dag.get_mut(id).expect("checked above");
        task.status = TaskStatus::InProgress;
        let file = task.source_file;
        state.persist_file(file);
        Ok(())
    }

    /// Complete a task and propagate to its direct dependents, all inside
    /// one critical section. Returns the ids that became ready.
    pub fn mark_complete(&self, id: &str, update: TaskUpdate) -> Result<Vec<String>, SourceError> {
        let mut state = self.lock();
        let task = state
            .dag
            .get_mut(id)
            .ok_or_else(|| SourceError::UnknownTask(id.to_string()))?;
        if task.status == TaskStatus::Completed {
            return Err(SourceError::InvalidTransition {
                id: id.to_string(),
                status: task.status,
                expected: "pending or in_progress",
            });
        }

        task.status = TaskStatus::Completed;
        task.passes = Some(true);
        task.completed_at = Some(Utc::now());
        if update.validation_results.is_some() {
            task.validation_results = update.validation_results;
        }
        if update.judge_results.is_some() {
            task.judge_results = update.judge_results;
        }
        if update.evidence_path.is_some() {
            task.evidence_path = update.evidence_path;
        }
        let file = task.source_file;

        let unblocked = state.newly_ready_dependents(id);
        state.persist_file(file);
        Ok(unblocked)
    }

    /// Recompute readiness for the direct dependents of a completed task.
    pub fn propagate_completion(&self, id: &str) -> Vec<String> {
        let state = self.lock();
        state.newly_ready_dependents(id)
    }

    /// Record a failed attempt: the task returns to `pending` and its
    /// attempt counter carries forward (monotonically increasing).
    pub fn record_failure(
        &self,
        id: &str,
        validation: Option<ValidationResults>,
    ) -> Result<(), SourceError> {
        let mut state = self.lock();
        let task = state
            .dag
            .get_mut(id)
            .ok_or_else(|| SourceError::UnknownTask(id.to_string()))?;
        if task.status == TaskStatus::Completed {
            return Err(SourceError::InvalidTransition {
                id: id.to_string(),
                status: task.status,
                expected: "in_progress",
            });
        }
        task.status = TaskStatus::Pending;
        match validation {
            Some(v) => task.validation_results = Some(v),
            None => {
                // Keep the attempt counter moving even when the failure
                // happened before validation ran.
                let attempts = task.attempts() + 1;
                let results = task
                    .validation_results
                    .get_or_insert_with(ValidationResults::default);
                results.attempts = attempts;
                results.passed = false;
            }
        }
        let file = task.source_file;
        state.persist_file(file);
        Ok(())
    }

    /// Append planner-generated tasks to the primary PRD file. Tasks whose
    /// id collides with an existing one, or whose dependencies are
    /// unknown, are discarded. Returns the ids actually added.
    pub fn append_tasks(&self, tasks: Vec<Task>) -> Vec<String> {
        let mut state = self.lock();
        let mut added = Vec::new();
        for mut task in tasks {
            task.normalize();
            task.source_file = 0;
            let id = task.id.clone();
            match state.dag.push(task) {
                Ok(()) => {
                    state.files[0].item_ids.push(id.clone());
                    added.push(id);
                }
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "discarding planner task");
                }
            }
        }
        if !added.is_empty() {
            state.persist_file(0);
        }
        added
    }

    /// Aggregate counts across all loaded tasks.
    pub fn get_summary(&self) -> TaskSummary {
        let state = self.lock();
        let mut summary = TaskSummary::default();
        for task in state.dag.iter() {
            summary.total += 1;
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Blocked => summary.blocked += 1,
            }
            if let Some(ref category) = task.category {
                *summary.by_category.entry(category.clone()).or_default() += 1;
            }
            *summary
                .by_priority
                .entry(task.priority.to_string())
                .or_default() += 1;
        }
        summary
    }

    /// Longest dependency chain, for status reporting.
    pub fn critical_path(&self) -> Vec<String> {
        self.lock().dag.critical_path()
    }

    /// Look up a single task by id.
    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.lock().dag.get(id).cloned()
    }

    /// Reset an orphaned `in_progress` task back to pending (session
    /// resume path). No-op when the task is already pending.
    pub fn release_task(&self, id: &str) {
        let mut state = self.lock();
        if let Some(task) = state.dag.get_mut(id) {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                let file = task.source_file;
                state.persist_file(file);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SourceState {
    /// Ids of direct dependents of `id` that are now ready.
    fn newly_ready_dependents(&self, id: &str) -> Vec<String> {
        self.dag
            .dependents_of(id)
            .iter()
            .filter(|dep| self.dag.is_ready(dep))
            .cloned()
            .collect()
    }

    /// Rewrite one PRD file in full. Best-effort: failures are logged and
    /// memory stays authoritative.
    fn persist_file(&mut self, file_index: usize) {
        let Some(loaded) = self.files.get(file_index) else {
            return;
        };

        let mut prd = loaded.shell.clone();
        prd.items = loaded
            .item_ids
            .iter()
            .filter_map(|id| self.dag.get(id).cloned())
            .collect();
        let metadata = prd.metadata.get_or_insert_with(PrdMetadata::default);
        metadata.updated_at = Some(Utc::now().to_rfc3339());

        let path = &loaded.path;
        let serialized = match serde_json::to_string_pretty(&prd) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to serialize PRD");
                return;
            }
        };
        if let Err(e) = std::fs::write(path, serialized) {
            tracing::error!(path = %path.display(), error = %e, "failed to write PRD file; in-memory state stays authoritative");
        }
    }
}

/// Resolve the list of candidate PRD files from the options.
fn discover_prd_files(options: &SourceOptions) -> Vec<PathBuf> {
    if let Some(ref file) = options.prd_file {
        return vec![file.clone()];
    }
    let Some(ref dir) = options.prd_dir else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect(),
        Err(_) => Vec::new(),
    };
    paths.sort();
    paths
}

/// Convenience for tests and the CLI: initialize against a single file.
pub fn single_file(path: impl Into<PathBuf>) -> SourceOptions {
    SourceOptions {
        prd_file: Some(path.into()),
        prd_dir: None,
        lenient: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    fn write_prd(dir: &Path, name: &str, body: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
        path
    }

    fn linear_prd() -> serde_json::Value {
        serde_json::json!({
            "project": "demo",
            "items": [
                {"id": "a", "description": "first", "priority": "high"},
                {"id": "b", "description": "second", "priority": "medium", "dependencies": ["a"]},
                {"id": "c", "description": "third", "priority": "medium", "dependencies": ["b"]}
            ],
            "metadata": {"provider": "claude"}
        })
    }

    #[test]
    fn initialize_fails_without_prd() {
        let tmp = tempfile::tempdir().unwrap();
        let err = TaskSource::initialize(&SourceOptions {
            prd_file: None,
            prd_dir: Some(tmp.path().to_path_buf()),
            lenient: false,
        })
        .unwrap_err();
        assert!(matches!(err, SourceError::NoPrdFound { .. }));
    }

    #[test]
    fn initialize_skips_malformed_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.json"), "{not json").unwrap();
        write_prd(tmp.path(), "good.json", linear_prd());

        let source = TaskSource::initialize(&SourceOptions {
            prd_file: None,
            prd_dir: Some(tmp.path().to_path_buf()),
            lenient: false,
        })
        .unwrap();
        assert_eq!(source.get_summary().total, 3);
    }

    #[test]
    fn next_task_follows_dependency_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        let next = source.get_next_task(&TaskFilter::default()).unwrap();
        assert_eq!(next.id, "a");

        // b is not ready until a completes.
        let ready: Vec<String> = source
            .get_ready_tasks(&TaskFilter::default())
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec!["a"]);
    }

    #[test]
    fn mark_complete_propagates_to_dependents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        source.mark_in_progress("a").unwrap();
        let unblocked = source.mark_complete("a", TaskUpdate::default()).unwrap();
        assert_eq!(unblocked, vec!["b".to_string()]);

        let summary = source.get_summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 2);
    }

    #[test]
    fn mark_in_progress_rejects_unmet_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        let err = source.mark_in_progress("b").unwrap_err();
        assert!(matches!(err, SourceError::InvalidTransition { .. }));
    }

    #[test]
    fn mark_complete_twice_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        source.mark_in_progress("a").unwrap();
        source.mark_complete("a", TaskUpdate::default()).unwrap();
        let err = source.mark_complete("a", TaskUpdate::default()).unwrap_err();
        assert!(matches!(err, SourceError::InvalidTransition { .. }));
    }

    #[test]
    fn record_failure_returns_task_to_pending_and_counts_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        source.mark_in_progress("a").unwrap();
        source.record_failure("a", None).unwrap();
        let task = source.get_task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts(), 1);

        source.mark_in_progress("a").unwrap();
        source.record_failure("a", None).unwrap();
        assert_eq!(source.get_task("a").unwrap().attempts(), 2);
    }

    #[test]
    fn completion_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());

        {
            let source = TaskSource::initialize(&single_file(&path)).unwrap();
            source.mark_in_progress("a").unwrap();
            source.mark_complete("a", TaskUpdate::default()).unwrap();
        }

        let reloaded = TaskSource::initialize(&single_file(&path)).unwrap();
        let task = reloaded.get_task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.passes, Some(true));
        assert_eq!(reloaded.get_next_task(&TaskFilter::default()).unwrap().id, "b");
    }

    #[test]
    fn round_trip_preserves_unknown_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let mut body = linear_prd();
        body["items"][0]["estimated_hours"] = serde_json::json!(2.5);
        body["custom_top_level"] = serde_json::json!({"k": "v"});
        let path = write_prd(tmp.path(), "prd.json", body);

        let source = TaskSource::initialize(&single_file(&path)).unwrap();
        // Trigger a rewrite without changing task content.
        source.mark_in_progress("a").unwrap();
        source.record_failure("a", None).unwrap();

        let reread: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            reread["items"][0]["estimated_hours"],
            serde_json::json!(2.5)
        );
        assert_eq!(reread["custom_top_level"]["k"], serde_json::json!("v"));
        assert!(reread["metadata"]["updated_at"].is_string());
        assert_eq!(reread["metadata"]["provider"], serde_json::json!("claude"));
    }

    #[test]
    fn append_tasks_discards_collisions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();

        let mut fresh = Task::new("d", "new work");
        fresh.priority = Priority::Low;
        let colliding = Task::new("a", "duplicate");

        let added = source.append_tasks(vec![fresh, colliding]);
        assert_eq!(added, vec!["d".to_string()]);
        assert_eq!(source.get_summary().total, 4);

        // The appended task landed in the file.
        let reread: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let ids: Vec<&str> = reread["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"d"));
    }

    #[test]
    fn file_provider_comes_from_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_prd(tmp.path(), "prd.json", linear_prd());
        let source = TaskSource::initialize(&single_file(&path)).unwrap();
        assert_eq!(source.file_provider("a").as_deref(), Some("claude"));
    }
}
