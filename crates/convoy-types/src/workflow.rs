// Workflow run state: phases, limits, checkpoints, and the event feed
// emitted by the orchestrator as a run progresses.

use crate::delegate::{DelegateKind, DelegateStatus};
use crate::event::ContextUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Phases and outcomes
// ============================================================================

/// Phase of a workflow run. Transitions are linear with one loop:
/// Decomposing -> Implementing (repeated) -> Reviewing -> FixImplementing
/// -> Implementing again, ending in Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    Decomposing,
    Implementing,
    Reviewing,
    FixImplementing,
    Terminal,
}

/// Why a run reached Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    /// Every task closed and review passed (or review was skipped).
    Completed,
    /// Cancelled by the caller.
    Cancelled,
    /// Tasks remain but none are actionable (all blocked or errored).
    Stalled,
    /// The iteration or review budget ran out with work remaining.
    IterationLimitReached,
}

/// How a single turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

// ============================================================================
// Limits
// ============================================================================

fn default_max_iterations() -> u32 {
    100
}

fn default_max_review_iterations() -> u32 {
    2
}

/// Budgets for a run. Iterations are counted globally across the implement
/// and fix loops; review passes have their own smaller budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLimits {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_review_iterations")]
    pub max_review_iterations: u32,
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_review_iterations: default_max_review_iterations(),
        }
    }
}

// ============================================================================
// Run state
// ============================================================================

/// Persistent state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,
    /// The objective given at start, verbatim.
    pub objective: String,
    /// Backend adapter id the run drives.
    pub provider: String,
    pub phase: WorkflowPhase,
    /// Implementing iterations consumed so far (1-based once the loop starts).
    pub iteration: u32,
    /// Review passes consumed so far.
    pub review_iteration: u32,
    pub limits: WorkflowLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalOutcome>,
    /// Canonical session the run is bound to, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Last checkpoint written for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkflowRun {
    pub fn new(
        run_id: impl Into<String>,
        objective: impl Into<String>,
        provider: impl Into<String>,
        limits: WorkflowLimits,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            objective: objective.into(),
            provider: provider.into(),
            phase: WorkflowPhase::Idle,
            iteration: 0,
            review_iteration: 0,
            limits,
            terminal: None,
            session_id: None,
            checkpoint_path: None,
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == WorkflowPhase::Terminal
    }
}

/// Snapshot written at phase boundaries and on cancellation. Resuming a run
/// restores the same iteration counter and the remaining task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: String,
    pub phase: WorkflowPhase,
    pub iteration: u32,
    pub review_iteration: u32,
    /// Ids of tasks not yet completed when the checkpoint was taken.
    pub remaining_task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub objective: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Iteration records
// ============================================================================

/// Summary of one Implementing iteration, appended to the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: TurnOutcome,
    /// Tool name -> invocation count observed during the iteration.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools_used: HashMap<String, u32>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub delegates_spawned: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ContextUsage>,
}

// ============================================================================
// Workflow event feed
// ============================================================================

/// Events emitted by the orchestrator for observers. Distinct from the
/// canonical agent event stream: these describe the run, not the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: String,
        objective: String,
        provider: String,
        timestamp: DateTime<Utc>,
    },
    PhaseChanged {
        run_id: String,
        from: WorkflowPhase,
        to: WorkflowPhase,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },
    IterationCompleted {
        run_id: String,
        record: IterationRecord,
        timestamp: DateTime<Utc>,
    },
    DelegateDispatched {
        run_id: String,
        delegate_id: String,
        kind: DelegateKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    DelegateResolved {
        run_id: String,
        delegate_id: String,
        status: DelegateStatus,
        timestamp: DateTime<Utc>,
    },
    ReviewCompleted {
        run_id: String,
        fixes_required: bool,
        findings: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    CheckpointSaved {
        run_id: String,
        path: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: String,
        outcome: TerminalOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_path: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_defaults() {
        let limits: WorkflowLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits.max_iterations, 100);
        assert_eq!(limits.max_review_iterations, 2);
        assert_eq!(limits, WorkflowLimits::default());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let checkpoint = Checkpoint {
            run_id: "run_1".to_string(),
            phase: WorkflowPhase::Implementing,
            iteration: 4,
            review_iteration: 0,
            remaining_task_ids: vec!["task_2".to_string(), "task_3".to_string()],
            session_id: Some("sess_1".to_string()),
            objective: "build the thing".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.iteration, 4);
        assert_eq!(restored.phase, WorkflowPhase::Implementing);
        assert_eq!(restored.remaining_task_ids.len(), 2);
    }

    #[test]
    fn test_workflow_event_tagging() {
        let event = WorkflowEvent::PhaseChanged {
            run_id: "run_1".to_string(),
            from: WorkflowPhase::Decomposing,
            to: WorkflowPhase::Implementing,
            iteration: 1,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "phase_changed");
        assert_eq!(value["from"], "decomposing");
        assert_eq!(value["to"], "implementing");
    }
}
