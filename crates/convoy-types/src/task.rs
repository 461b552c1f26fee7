use serde::{Deserialize, Serialize};

/// Status of a task in the persisted task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started; runnable once dependencies complete.
    Pending,
    /// Claimed by the parent turn or a delegate.
    InProgress,
    /// Finished successfully. Convergence requires every task here.
    Completed,
    /// Failed; blocks dependents.
    Error,
    /// Waiting on a failed or blocked dependency.
    Blocked,
}

/// One unit of work in a run.
///
/// Ids are immutable and unique within a run: once the list is seeded, no
/// producer may introduce, rename, or merge ids (the store's guarded
/// reconcile enforces this).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}
