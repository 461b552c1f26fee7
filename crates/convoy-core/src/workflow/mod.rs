// Workflow Orchestrator
// Drives decompose -> implement -> review runs over one backend session,
// persisting run state, checkpoints, and history under the data directory.

mod checkpoint;
mod engine;
mod prompts;

pub use checkpoint::{default_data_dir, RunStore};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use convoy_types::{SessionConfig, WorkflowEvent, WorkflowLimits, WorkflowPhase, WorkflowRun};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConvoyError, Result};
use crate::router::DEFAULT_TASK_TOOL;
use crate::session::SessionManager;
use crate::store::TaskStore;

const WORKFLOW_EVENT_BUFFER: usize = 256;
const DEFAULT_DELEGATE_TOOL: &str = "delegate";
const DEFAULT_DELEGATE_DEADLINE: Duration = Duration::from_secs(120);
const DEFAULT_MAX_PARALLEL_DELEGATES: usize = 4;

/// Everything configurable about one run.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Adapter id the run is bound to.
    pub provider: String,
    pub session: SessionConfig,
    pub limits: WorkflowLimits,
    pub routing: crate::dispatch::RoutingPolicy,
    /// How long an instructional dispatch may wait for attribution.
    pub delegate_deadline: Duration,
    pub max_parallel_delegates: usize,
    /// Tool name whose completions carry task list updates.
    pub task_tool: String,
    /// Tool name registered for instructional delegation.
    pub delegate_tool: String,
    /// Resume the given run from its last checkpoint instead of starting
    /// fresh.
    pub resume_from_checkpoint: Option<String>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            session: SessionConfig::default(),
            limits: WorkflowLimits::default(),
            routing: crate::dispatch::RoutingPolicy::default(),
            delegate_deadline: DEFAULT_DELEGATE_DEADLINE,
            max_parallel_delegates: DEFAULT_MAX_PARALLEL_DELEGATES,
            task_tool: DEFAULT_TASK_TOOL.to_string(),
            delegate_tool: DEFAULT_DELEGATE_TOOL.to_string(),
            resume_from_checkpoint: None,
        }
    }
}

/// Caller's grip on a running workflow.
#[derive(Clone)]
pub struct WorkflowHandle {
    run_id: String,
    cancel: CancellationToken,
    state: watch::Receiver<WorkflowRun>,
}

impl WorkflowHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cancellation. The engine interrupts delegates, checkpoints,
    /// and finishes the run as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Latest run snapshot.
    pub fn status(&self) -> WorkflowRun {
        self.state.borrow().clone()
    }

    /// Wait until the run reaches a terminal phase and return the final
    /// snapshot.
    pub async fn wait(&mut self) -> WorkflowRun {
        loop {
            let snapshot = self.state.borrow().clone();
            if snapshot.is_terminal() {
                return snapshot;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

/// Starts runs and tracks them by run id.
pub struct WorkflowManager {
    sessions: Arc<SessionManager>,
    data_dir: PathBuf,
    events: broadcast::Sender<WorkflowEvent>,
    runs: Mutex<HashMap<String, WorkflowHandle>>,
}

impl WorkflowManager {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let (events, _) = broadcast::channel(WORKFLOW_EVENT_BUFFER);
        Self {
            sessions,
            data_dir: default_data_dir(),
            events,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Read-only feed of phase, iteration, and delegate notifications across
    /// all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Start (or resume) a run. The engine is spawned onto the runtime; the
    /// returned handle observes and controls it.
    pub async fn start(&self, objective: &str, options: WorkflowOptions) -> Result<WorkflowHandle> {
        let (run, resume) = match &options.resume_from_checkpoint {
            Some(resume_id) => {
                let run_store = RunStore::new(&self.data_dir, resume_id);
                let Some(checkpoint) = run_store.load_checkpoint().await? else {
                    return Err(ConvoyError::Checkpoint(format!(
                        "no checkpoint recorded for run {}",
                        resume_id
                    )));
                };
                let mut run = match run_store.load_run().await? {
                    Some(run) => run,
                    None => WorkflowRun::new(
                        resume_id.clone(),
                        checkpoint.objective.clone(),
                        options.provider.clone(),
                        options.limits,
                    ),
                };
                run.phase = checkpoint.phase;
                // The iteration in flight at checkpoint time is re-run.
                run.iteration = if checkpoint.phase == WorkflowPhase::Implementing {
                    checkpoint.iteration.saturating_sub(1)
                } else {
                    checkpoint.iteration
                };
                run.review_iteration = if checkpoint.phase == WorkflowPhase::Reviewing {
                    checkpoint.review_iteration.saturating_sub(1)
                } else {
                    checkpoint.review_iteration
                };
                run.terminal = None;
                run.ended_at = None;
                run.error_message = None;
                tracing::info!(
                    run_id = %run.run_id,
                    phase = ?run.phase,
                    iteration = run.iteration,
                    "resuming run from checkpoint"
                );
                (run, Some(checkpoint))
            }
            None => {
                let run_id = format!("run_{}", Uuid::new_v4().simple());
                (
                    WorkflowRun::new(run_id, objective, options.provider.clone(), options.limits),
                    None,
                )
            }
        };

        let run_id = run.run_id.clone();
        let run_store = RunStore::new(&self.data_dir, &run_id);
        let store = Arc::new(TaskStore::new(run_store.tasks_path()));
        let (state_tx, state_rx) = watch::channel(run.clone());
        let cancel = CancellationToken::new();

        let engine = engine::Engine::new(
            run,
            options,
            self.sessions.clone(),
            run_store,
            store,
            self.events.clone(),
            state_tx,
            cancel.clone(),
            resume,
        );
        tokio::spawn(engine.run());

        let handle = WorkflowHandle {
            run_id: run_id.clone(),
            cancel,
            state: state_rx,
        };
        self.runs.lock().await.insert(run_id, handle.clone());
        Ok(handle)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| ConvoyError::UnknownRun(run_id.to_string()))?;
        handle.cancel();
        Ok(())
    }

    /// Snapshot of a tracked run, falling back to its persisted state when
    /// the manager no longer holds a live handle.
    pub async fn status(&self, run_id: &str) -> Result<WorkflowRun> {
        if let Some(handle) = self.runs.lock().await.get(run_id) {
            return Ok(handle.status());
        }
        match RunStore::new(&self.data_dir, run_id).load_run().await? {
            Some(run) => Ok(run),
            None => Err(ConvoyError::UnknownRun(run_id.to_string())),
        }
    }

    /// Wait for a tracked run to finish.
    pub async fn wait(&self, run_id: &str) -> Result<WorkflowRun> {
        let mut handle = {
            let runs = self.runs.lock().await;
            runs.get(run_id)
                .cloned()
                .ok_or_else(|| ConvoyError::UnknownRun(run_id.to_string()))?
        };
        Ok(handle.wait().await)
    }
}
