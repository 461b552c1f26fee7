use serde::{Deserialize, Serialize};

/// How a delegate was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateKind {
    /// Native backend primitive; deterministic, stable id up front.
    Structural,
    /// Directive injected into the parent turn; best-effort.
    Instructional,
}

/// Lifecycle state of a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateStatus {
    Pending,
    Running,
    Completed,
    Error,
    /// Cut short by cancellation. Never coerced to completed or error.
    Interrupted,
    /// Detached work, excluded from convergence accounting by default policy.
    Background,
}

impl DelegateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DelegateStatus::Completed | DelegateStatus::Error | DelegateStatus::Interrupted
        )
    }
}

/// The work a delegate is asked to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTask {
    /// Store task this delegate is bound to, when the dispatch targets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub description: String,
}

impl DelegateTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task_id: None,
            description: description.into(),
        }
    }

    pub fn for_task(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            description: description.into(),
        }
    }
}

/// Dispatcher-owned record of one delegate. The orchestrator only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateHandle {
    pub id: String,
    pub kind: DelegateKind,
    pub task: DelegateTask,
    pub status: DelegateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final assistant text reported on `subagent.complete`, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DelegateHandle {
    pub fn new(id: impl Into<String>, kind: DelegateKind, task: DelegateTask) -> Self {
        Self {
            id: id.into(),
            kind,
            task,
            status: DelegateStatus::Pending,
            error: None,
            summary: None,
            created_at: chrono::Utc::now(),
        }
    }
}
