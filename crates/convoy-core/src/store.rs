use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use convoy_types::{Task, TaskStatus};
use tokio::fs;
use uuid::Uuid;

use crate::error::{ConvoyError, Result};

/// Externally persisted task list for one workflow run.
///
/// The file is the canonical state: reads load it fresh and writes replace it
/// atomically (temp file in the same directory, then rename), so external
/// readers never observe a partial file. Seeding goes through `save`; every
/// other mutation goes through the guarded `reconcile`.
pub struct TaskStore {
    path: PathBuf,
    rejections: AtomicU64,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconciliations rejected for carrying unknown ids. This counter is the
    /// observability hook that makes dropped updates detectable.
    pub fn rejected_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Current persisted tasks. A missing file is an empty store.
    pub async fn load(&self) -> Result<Vec<Task>> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the persisted list wholesale.
    pub async fn save(&self, tasks: &[Task]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_string_pretty(tasks)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Guarded merge: known tasks take the incoming status, description, and
    /// dependencies. Any incoming id outside the persisted set rejects the
    /// whole call, leaves the file untouched, and bumps the rejection
    /// counter; no partial application occurs.
    pub async fn reconcile(&self, incoming: &[Task]) -> Result<Vec<Task>> {
        let mut current = self.load().await?;
        let known: HashSet<&str> = current.iter().map(|t| t.id.as_str()).collect();
        let mut unknown_ids: Vec<String> = incoming
            .iter()
            .filter(|t| !known.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();
        if !unknown_ids.is_empty() {
            unknown_ids.sort();
            unknown_ids.dedup();
            self.rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                unknown_ids = ?unknown_ids,
                "rejecting task reconciliation with ids outside the store"
            );
            return Err(ConvoyError::TaskReconciliationRejected { unknown_ids });
        }

        for update in incoming {
            if let Some(task) = current.iter_mut().find(|t| t.id == update.id) {
                task.status = update.status;
                task.description = update.description.clone();
                task.dependencies = update.dependencies.clone();
            }
        }
        self.save(&current).await?;
        Ok(current)
    }

    /// Status-only update through the same guard as `reconcile`.
    pub async fn mark_status(&self, task_id: &str, status: TaskStatus) -> Result<Vec<Task>> {
        let current = self.load().await?;
        let Some(task) = current.iter().find(|t| t.id == task_id) else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task_id, "rejecting status update for unknown task");
            return Err(ConvoyError::TaskReconciliationRejected {
                unknown_ids: vec![task_id.to_string()],
            });
        };
        let update = task.clone().with_status(status);
        self.reconcile(std::slice::from_ref(&update)).await
    }

    pub async fn has_actionable_work(&self) -> Result<bool> {
        Ok(has_actionable_work(&self.load().await?))
    }

    pub async fn all_completed(&self) -> Result<bool> {
        Ok(all_completed(&self.load().await?))
    }
}

/// Tasks runnable right now: pending or in progress with every dependency
/// completed. Blocked and errored tasks are never actionable, and a
/// dependency missing from the list never counts as satisfied.
pub fn actionable(tasks: &[Task]) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|task| {
            matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress)
                && task.dependencies.iter().all(|dep| {
                    tasks
                        .iter()
                        .any(|t| t.id == *dep && t.status == TaskStatus::Completed)
                })
        })
        .collect()
}

/// True when at least one task is actionable.
pub fn has_actionable_work(tasks: &[Task]) -> bool {
    !actionable(tasks).is_empty()
}

/// The sole convergence predicate: every task completed. Computed from the
/// given snapshot only, never from counters of events seen so far.
pub fn all_completed(tasks: &[Task]) -> bool {
    tasks.iter().all(|t| t.status == TaskStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TaskStore {
        TaskStore::new(dir.path().join("tasks.json"))
    }

    fn seed() -> Vec<Task> {
        vec![
            Task::new("task_1", "write the parser"),
            Task::new("task_2", "write the tests").with_dependencies(vec!["task_1".to_string()]),
            Task::new("task_3", "update the docs"),
        ]
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.save(&seed()).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].dependencies, vec!["task_1".to_string()]);
        assert_eq!(loaded[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_applies_status_updates() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.save(&seed()).await.expect("save");

        let updates = vec![
            Task::new("task_1", "write the parser").with_status(TaskStatus::Completed),
            Task::new("task_2", "write the tests")
                .with_dependencies(vec!["task_1".to_string()])
                .with_status(TaskStatus::InProgress),
        ];
        let merged = store.reconcile(&updates).await.expect("reconcile");
        assert_eq!(merged[0].status, TaskStatus::Completed);
        assert_eq!(merged[1].status, TaskStatus::InProgress);
        assert_eq!(merged[2].status, TaskStatus::Pending);
        assert_eq!(store.rejected_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_rejects_wholesale_and_leaves_file_untouched() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.save(&seed()).await.expect("save");
        let before = std::fs::read(dir.path().join("tasks.json")).expect("read before");

        // One known update and one unknown id: nothing may be applied.
        let updates = vec![
            Task::new("task_1", "write the parser").with_status(TaskStatus::Completed),
            Task::new("task_9", "sneaky new work"),
        ];
        let err = store.reconcile(&updates).await.expect_err("must reject");
        match err {
            ConvoyError::TaskReconciliationRejected { unknown_ids } => {
                assert_eq!(unknown_ids, vec!["task_9".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let after = std::fs::read(dir.path().join("tasks.json")).expect("read after");
        assert_eq!(before, after, "file must be bit-for-bit unchanged");
        assert_eq!(store.rejected_count(), 1);

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_status_guards_unknown_ids() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.save(&seed()).await.expect("save");

        store
            .mark_status("task_3", TaskStatus::InProgress)
            .await
            .expect("known id");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded[2].status, TaskStatus::InProgress);

        let err = store
            .mark_status("task_42", TaskStatus::Completed)
            .await
            .expect_err("unknown id");
        assert!(matches!(
            err,
            ConvoyError::TaskReconciliationRejected { .. }
        ));
        assert_eq!(store.rejected_count(), 1);
    }

    #[test]
    fn test_actionable_work_respects_dependencies() {
        let mut tasks = seed();
        assert!(has_actionable_work(&tasks));

        // task_2 waits on task_1; once only task_2 remains pending it is
        // actionable only after task_1 completes.
        tasks[0].status = TaskStatus::Error;
        tasks[1].status = TaskStatus::Pending;
        tasks[2].status = TaskStatus::Completed;
        assert!(!has_actionable_work(&tasks));

        tasks[0].status = TaskStatus::Completed;
        assert!(has_actionable_work(&tasks));
    }

    #[test]
    fn test_unknown_dependency_is_never_satisfied() {
        let tasks = vec![Task::new("task_1", "depends on a ghost")
            .with_dependencies(vec!["task_0".to_string()])];
        assert!(!has_actionable_work(&tasks));
    }

    #[test]
    fn test_all_completed_predicate() {
        let mut tasks = seed();
        assert!(!all_completed(&tasks));
        for task in &mut tasks {
            task.status = TaskStatus::Completed;
        }
        assert!(all_completed(&tasks));
    }
}
