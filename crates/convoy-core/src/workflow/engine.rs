// The run engine: owns one workflow run end to end. Decomposes the objective
// into the task store, loops implementing iterations with delegate dispatch,
// reviews the result, and lands on exactly one terminal outcome. All progress
// is read back from persisted task state, never from in-memory counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_providers::ProviderError;
use convoy_types::{
    AgentEvent, Checkpoint, ContextUsage, DelegateKind, DelegateStatus, DelegateTask,
    EventPayload, IterationRecord, TaskStatus, TerminalOutcome, TurnOutcome, WorkflowEvent,
    WorkflowPhase, WorkflowRun,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DelegateDispatcher, Dispatch};
use crate::error::{ConvoyError, Result};
use crate::router::TaskEventRouter;
use crate::session::SessionManager;
use crate::store::{self, TaskStore};

use super::checkpoint::RunStore;
use super::prompts;
use super::WorkflowOptions;

/// Quiet window used to let already-buffered events settle after a turn is
/// interrupted or while delegates are still resolving.
const SETTLE_WINDOW: Duration = Duration::from_millis(25);

pub(crate) struct Engine {
    run: WorkflowRun,
    options: WorkflowOptions,
    sessions: Arc<SessionManager>,
    run_store: RunStore,
    store: Arc<TaskStore>,
    events: broadcast::Sender<WorkflowEvent>,
    state: watch::Sender<WorkflowRun>,
    cancel: CancellationToken,
    resume: Option<Checkpoint>,
    fix_specification: Option<String>,
}

/// Per-run wiring built once the backend session exists.
struct RunCtx {
    session_id: String,
    structural: bool,
    rx: broadcast::Receiver<AgentEvent>,
    dispatcher: Arc<DelegateDispatcher>,
    router: TaskEventRouter,
}

enum ImplementOutcome {
    Converged,
    Cancelled,
    Stalled,
    LimitReached,
}

enum ReviewOutcome {
    Passed,
    FixesRequired(String),
    BudgetExhausted,
    Cancelled,
}

enum TurnStep {
    Event(AgentEvent),
    Lagged(u64),
    Closed,
    Cancelled,
    Superseded,
    Deadline,
}

struct TurnResult {
    outcome: TurnOutcome,
    text: String,
    tools_used: HashMap<String, u32>,
    errors: Vec<String>,
    usage: Option<ContextUsage>,
}

impl TurnResult {
    fn new() -> Self {
        Self {
            outcome: TurnOutcome::Completed,
            text: String::new(),
            tools_used: HashMap::new(),
            errors: Vec::new(),
            usage: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            outcome: TurnOutcome::Failed(message.clone()),
            text: String::new(),
            tools_used: HashMap::new(),
            errors: vec![message],
            usage: None,
        }
    }
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run: WorkflowRun,
        options: WorkflowOptions,
        sessions: Arc<SessionManager>,
        run_store: RunStore,
        store: Arc<TaskStore>,
        events: broadcast::Sender<WorkflowEvent>,
        state: watch::Sender<WorkflowRun>,
        cancel: CancellationToken,
        resume: Option<Checkpoint>,
    ) -> Self {
        Self {
            run,
            options,
            sessions,
            run_store,
            store,
            events,
            state,
            cancel,
            resume,
            fix_specification: None,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(err) = self.drive().await {
            tracing::error!(run_id = %self.run.run_id, error = %err, "workflow run aborted");
            self.run.error_message = Some(err.to_string());
            self.run.ended_at = Some(Utc::now());
            self.run.phase = WorkflowPhase::Terminal;
            if let Err(save_err) = self.run_store.save_run(&self.run).await {
                tracing::warn!(error = %save_err, "failed to persist aborted run");
            }
            let _ = self.state.send(self.run.clone());
            if let Some(session_id) = self.run.session_id.clone() {
                if let Err(destroy_err) = self.sessions.destroy(&session_id).await {
                    tracing::warn!(session_id, error = %destroy_err, "session teardown failed");
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.run_store.ensure_dir().await?;
        self.emit(WorkflowEvent::RunStarted {
            run_id: self.run.run_id.clone(),
            objective: self.run.objective.clone(),
            provider: self.run.provider.clone(),
            timestamp: Utc::now(),
        })
        .await;

        // Subscribe before the session exists so nothing emitted during
        // creation or between turns is ever missed.
        let rx = self.sessions.hub().subscribe();
        let session_id = self.establish_session().await?;
        self.run.session_id = Some(session_id.clone());
        self.push_state().await?;

        let adapter = self.sessions.session_adapter(&session_id).await?;
        let structural = adapter.capabilities().supports_structural_delegation;
        let dispatcher = Arc::new(
            DelegateDispatcher::new(adapter, &session_id)
                .with_policy(self.options.routing)
                .with_pending_deadline(self.options.delegate_deadline)
                .with_max_parallel(self.options.max_parallel_delegates)
                .with_delegate_tool(&self.options.delegate_tool),
        );
        let router = TaskEventRouter::new(self.store.clone(), dispatcher.clone())
            .with_task_tool(&self.options.task_tool);
        let mut ctx = RunCtx {
            session_id,
            structural,
            rx,
            dispatcher,
            router,
        };

        loop {
            if self.cancel.is_cancelled() && !self.run.is_terminal() {
                return self.handle_cancellation(&mut ctx).await;
            }
            match self.run.phase {
                WorkflowPhase::Idle => self.set_phase(WorkflowPhase::Decomposing).await?,
                WorkflowPhase::Decomposing => {
                    self.seed_tasks(&mut ctx, None).await?;
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    self.set_phase(WorkflowPhase::Implementing).await?;
                }
                WorkflowPhase::FixImplementing => {
                    let specification = self
                        .fix_specification
                        .take()
                        .unwrap_or_else(|| self.run.objective.clone());
                    self.seed_tasks(&mut ctx, Some(&specification)).await?;
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    self.set_phase(WorkflowPhase::Implementing).await?;
                }
                WorkflowPhase::Implementing => match self.implement_loop(&mut ctx).await? {
                    ImplementOutcome::Converged => {
                        self.set_phase(WorkflowPhase::Reviewing).await?
                    }
                    ImplementOutcome::Cancelled => {
                        return self.handle_cancellation(&mut ctx).await
                    }
                    ImplementOutcome::Stalled => {
                        return self.finish(TerminalOutcome::Stalled).await
                    }
                    ImplementOutcome::LimitReached => {
                        return self.finish(TerminalOutcome::IterationLimitReached).await
                    }
                },
                WorkflowPhase::Reviewing => match self.review(&mut ctx).await? {
                    ReviewOutcome::Passed => return self.finish(TerminalOutcome::Completed).await,
                    ReviewOutcome::FixesRequired(specification) => {
                        self.fix_specification = Some(specification);
                        self.set_phase(WorkflowPhase::FixImplementing).await?;
                    }
                    ReviewOutcome::BudgetExhausted => {
                        return self.finish(TerminalOutcome::IterationLimitReached).await
                    }
                    ReviewOutcome::Cancelled => return self.handle_cancellation(&mut ctx).await,
                },
                WorkflowPhase::Terminal => return Ok(()),
            }
        }
    }

    /// Create the backend session, or reattach to the checkpointed one when
    /// resuming and the backend still knows it.
    async fn establish_session(&mut self) -> Result<String> {
        let mut config = self.options.session.clone();
        config
            .tools
            .push(prompts::task_tool_registration(&self.options.task_tool));
        config
            .tools
            .push(prompts::delegate_tool_registration(&self.options.delegate_tool));
        let provider = self.run.provider.clone();

        if let Some(previous) = self.resume.as_ref().and_then(|cp| cp.session_id.clone()) {
            match self
                .sessions
                .resume_session(&provider, &previous, config.clone())
                .await
            {
                Ok(Some(session_id)) => {
                    tracing::info!(session_id, "backend session resumed");
                    return Ok(session_id);
                }
                Ok(None) => {
                    tracing::warn!(session_id = %previous, "backend lost the session, starting fresh");
                }
                Err(ConvoyError::Provider(ProviderError::Unsupported(_))) => {
                    tracing::debug!(provider, "resume unsupported, starting fresh");
                }
                Err(err) => return Err(err),
            }
        }
        self.sessions.create_session(&provider, config).await
    }

    /// Run a decomposition turn and seed (or reseed) the task store from its
    /// response. An unparsable or failed decomposition is not fatal: the
    /// implement loop re-requests the breakdown in its continuation prompt.
    async fn seed_tasks(&mut self, ctx: &mut RunCtx, fix: Option<&str>) -> Result<()> {
        let prompt = match fix {
            Some(specification) => {
                prompts::fix_decomposition_prompt(specification, &self.options.task_tool)
            }
            None => prompts::decomposition_prompt(&self.run.objective, &self.options.task_tool),
        };
        let turn = match self.run_turn(ctx, &prompt).await {
            Ok(turn) => turn,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "decomposition turn failed, will retry while implementing");
                TurnResult::failed(err.to_string())
            }
            Err(err) => return Err(err),
        };
        match prompts::parse_task_list(&turn.text) {
            Some(tasks) => {
                tracing::info!(count = tasks.len(), "task list seeded");
                self.store.save(&tasks).await?;
            }
            None => {
                if !self.cancel.is_cancelled() {
                    tracing::warn!("decomposition produced no parsable task list");
                }
            }
        }
        self.checkpoint().await?;
        Ok(())
    }

    async fn implement_loop(&mut self, ctx: &mut RunCtx) -> Result<ImplementOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(ImplementOutcome::Cancelled);
            }
            if self.run.iteration >= self.run.limits.max_iterations {
                return Ok(ImplementOutcome::LimitReached);
            }
            self.run.iteration += 1;
            let started_at = Utc::now();
            self.checkpoint().await?;
            self.push_state().await?;

            let tasks_before = self.store.load().await?;
            let actionable = store::actionable(&tasks_before);
            let mut directives: Vec<String> = Vec::new();
            let mut delegates_spawned = 0usize;
            // The parent turn takes the first actionable task itself; the
            // rest fan out to delegates while capacity lasts. Instructional
            // dispatch rides the parent prompt, one directive at a time.
            for task in actionable.iter().skip(1) {
                if !ctx.structural && !directives.is_empty() {
                    break;
                }
                if !ctx.dispatcher.has_capacity().await {
                    break;
                }
                match ctx
                    .dispatcher
                    .dispatch(DelegateTask::for_task(&task.id, &task.description))
                    .await
                {
                    Ok(Dispatch::Structural { delegate_id }) => {
                        delegates_spawned += 1;
                        self.emit(WorkflowEvent::DelegateDispatched {
                            run_id: self.run.run_id.clone(),
                            delegate_id,
                            kind: DelegateKind::Structural,
                            task_id: Some(task.id.clone()),
                            timestamp: Utc::now(),
                        })
                        .await;
                    }
                    Ok(Dispatch::Instructional {
                        delegate_id,
                        directive,
                    }) => {
                        delegates_spawned += 1;
                        directives.push(directive);
                        self.emit(WorkflowEvent::DelegateDispatched {
                            run_id: self.run.run_id.clone(),
                            delegate_id,
                            kind: DelegateKind::Instructional,
                            task_id: Some(task.id.clone()),
                            timestamp: Utc::now(),
                        })
                        .await;
                    }
                    Err(err) => {
                        tracing::warn!(task = %task.id, error = %err, "delegate dispatch failed");
                        break;
                    }
                }
            }

            let prompt = prompts::continuation_prompt(
                &self.run.objective,
                &tasks_before,
                &directives,
                &self.options.task_tool,
            );
            let mut turn = match self.run_turn(ctx, &prompt).await {
                Ok(turn) => turn,
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(
                        iteration = self.run.iteration,
                        error = %err,
                        "turn failed, continuing the run"
                    );
                    TurnResult::failed(err.to_string())
                }
                Err(err) => return Err(err),
            };

            // A run whose decomposition never seeded gets another chance:
            // the continuation asked for the breakdown again.
            if tasks_before.is_empty() {
                if let Some(seeded) = prompts::parse_task_list(&turn.text) {
                    tracing::info!(count = seeded.len(), "task list seeded from continuation");
                    self.store.save(&seeded).await?;
                }
            }

            if ctx.dispatcher.unresolved_count().await > 0 {
                self.drain_settled(ctx, SETTLE_WINDOW).await;
            }
            for delegate_id in ctx.dispatcher.expire_pending().await {
                let err = ConvoyError::DelegationUncertain {
                    delegate_id: delegate_id.clone(),
                };
                turn.errors.push(err.to_string());
                self.emit(WorkflowEvent::DelegateResolved {
                    run_id: self.run.run_id.clone(),
                    delegate_id,
                    status: DelegateStatus::Error,
                    timestamp: Utc::now(),
                })
                .await;
            }

            // Convergence is judged on persisted state alone.
            let tasks = self.store.load().await?;
            let ended_at = Utc::now();
            let record = IterationRecord {
                iteration: self.run.iteration,
                started_at,
                ended_at,
                duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                outcome: turn.outcome.clone(),
                tools_used: turn.tools_used,
                tasks_total: tasks.len(),
                tasks_completed: tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .count(),
                delegates_spawned,
                errors: turn.errors,
                usage: turn.usage,
            };
            if let Err(err) = self.run_store.append_history(&record).await {
                tracing::warn!(error = %err, "iteration history append failed");
            }
            self.emit(WorkflowEvent::IterationCompleted {
                run_id: self.run.run_id.clone(),
                record,
                timestamp: Utc::now(),
            })
            .await;

            if self.cancel.is_cancelled() {
                return Ok(ImplementOutcome::Cancelled);
            }
            if !tasks.is_empty() && store::all_completed(&tasks) {
                return Ok(ImplementOutcome::Converged);
            }
            if !tasks.is_empty() && !store::has_actionable_work(&tasks) {
                return Ok(ImplementOutcome::Stalled);
            }
            if self.run.iteration >= self.run.limits.max_iterations {
                return Ok(ImplementOutcome::LimitReached);
            }
        }
    }

    async fn review(&mut self, ctx: &mut RunCtx) -> Result<ReviewOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(ReviewOutcome::Cancelled);
        }
        if self.run.review_iteration >= self.run.limits.max_review_iterations {
            return Ok(ReviewOutcome::BudgetExhausted);
        }
        self.run.review_iteration += 1;
        self.checkpoint().await?;
        self.push_state().await?;

        let tasks = self.store.load().await?;
        let prompt = prompts::review_prompt(&self.run.objective, &tasks);
        let text = if ctx.structural {
            match self.run_review_delegate(ctx, &prompt).await {
                Ok(Some(text)) => text,
                Ok(None) => String::new(),
                Err(err) => {
                    tracing::warn!(error = %err, "review delegate failed, reviewing in the parent turn");
                    match self.run_turn(ctx, &prompt).await {
                        Ok(turn) => turn.text,
                        Err(err) if err.is_recoverable() => String::new(),
                        Err(err) => return Err(err),
                    }
                }
            }
        } else {
            match self.run_turn(ctx, &prompt).await {
                Ok(turn) => turn.text,
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(error = %err, "review turn failed");
                    String::new()
                }
                Err(err) => return Err(err),
            }
        };
        if self.cancel.is_cancelled() {
            return Ok(ReviewOutcome::Cancelled);
        }

        let Some(verdict) = prompts::parse_review_verdict(&text) else {
            tracing::warn!(
                review = self.run.review_iteration,
                "review verdict unparsable, treating as pass"
            );
            self.emit(WorkflowEvent::ReviewCompleted {
                run_id: self.run.run_id.clone(),
                fixes_required: false,
                findings: Vec::new(),
                timestamp: Utc::now(),
            })
            .await;
            return Ok(ReviewOutcome::Passed);
        };
        self.emit(WorkflowEvent::ReviewCompleted {
            run_id: self.run.run_id.clone(),
            fixes_required: verdict.fixes_required,
            findings: verdict.findings.clone(),
            timestamp: Utc::now(),
        })
        .await;

        if !verdict.fixes_required {
            return Ok(ReviewOutcome::Passed);
        }
        if self.run.review_iteration >= self.run.limits.max_review_iterations {
            tracing::warn!("fixes required but the review budget is exhausted");
            return Ok(ReviewOutcome::BudgetExhausted);
        }
        let specification = verdict
            .fix_specification
            .clone()
            .unwrap_or_else(|| verdict.findings.join("\n"));
        Ok(ReviewOutcome::FixesRequired(specification))
    }

    /// Run the review inside a structural delegate and return its verdict
    /// text (the completion summary, falling back to delegate message text).
    async fn run_review_delegate(
        &self,
        ctx: &mut RunCtx,
        prompt: &str,
    ) -> Result<Option<String>> {
        let dispatch = ctx.dispatcher.dispatch(DelegateTask::new(prompt)).await?;
        let delegate_id = dispatch.delegate_id().to_string();
        self.emit(WorkflowEvent::DelegateDispatched {
            run_id: self.run.run_id.clone(),
            delegate_id: delegate_id.clone(),
            kind: DelegateKind::Structural,
            task_id: None,
            timestamp: Utc::now(),
        })
        .await;

        let deadline = tokio::time::Instant::now() + self.sessions.turn_timeout();
        let mut text = String::new();
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => TurnStep::Cancelled,
                _ = tokio::time::sleep_until(deadline) => TurnStep::Deadline,
                event = ctx.rx.recv() => match event {
                    Ok(event) => TurnStep::Event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => TurnStep::Lagged(skipped),
                    Err(broadcast::error::RecvError::Closed) => TurnStep::Closed,
                },
            };
            match step {
                TurnStep::Cancelled | TurnStep::Closed => return Ok(None),
                TurnStep::Deadline => {
                    tracing::warn!(delegate_id, "review delegate deadline elapsed");
                    return Ok(None);
                }
                TurnStep::Lagged(skipped) => {
                    tracing::warn!(skipped, "run receiver lagged behind the hub");
                }
                TurnStep::Superseded => {}
                TurnStep::Event(event) => {
                    if event.session_id != ctx.session_id {
                        continue;
                    }
                    self.route_event(ctx, &event).await;
                    if event.scope.delegate_id() != Some(delegate_id.as_str()) {
                        continue;
                    }
                    match &event.payload {
                        EventPayload::MessageComplete { text: chunk, .. } => {
                            text.push_str(chunk);
                            text.push('\n');
                        }
                        EventPayload::SubagentComplete { summary, .. } => {
                            return Ok(summary.clone().or_else(|| {
                                let trimmed = text.trim();
                                if trimmed.is_empty() {
                                    None
                                } else {
                                    Some(trimmed.to_string())
                                }
                            }));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drive one parent turn to resolution, routing every observed event
    /// through the dispatcher and the task router.
    async fn run_turn(&self, ctx: &mut RunCtx, prompt: &str) -> Result<TurnResult> {
        let token = self.sessions.begin_turn(&ctx.session_id, prompt).await?;
        let mut result = TurnResult::new();
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => TurnStep::Cancelled,
                _ = token.interrupted() => TurnStep::Superseded,
                _ = tokio::time::sleep_until(token.deadline()) => TurnStep::Deadline,
                event = ctx.rx.recv() => match event {
                    Ok(event) => TurnStep::Event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => TurnStep::Lagged(skipped),
                    Err(broadcast::error::RecvError::Closed) => TurnStep::Closed,
                },
            };
            match step {
                TurnStep::Cancelled => {
                    if let Err(err) = self.sessions.interrupt_turn(&token).await {
                        tracing::warn!(error = %err, "turn interrupt failed");
                    }
                    result.outcome = TurnOutcome::Interrupted;
                    self.drain_settled(ctx, SETTLE_WINDOW).await;
                    break;
                }
                TurnStep::Superseded => {
                    result.outcome = TurnOutcome::Interrupted;
                    break;
                }
                TurnStep::Deadline => {
                    tracing::warn!(session_id = %ctx.session_id, "turn deadline elapsed");
                    if let Err(err) = self.sessions.interrupt_turn(&token).await {
                        tracing::warn!(error = %err, "turn interrupt failed");
                    }
                    result.errors.push(ConvoyError::TurnTimeout.to_string());
                    result.outcome = TurnOutcome::Failed("turn deadline elapsed".to_string());
                    self.drain_settled(ctx, SETTLE_WINDOW).await;
                    break;
                }
                TurnStep::Lagged(skipped) => {
                    tracing::warn!(skipped, "run receiver lagged behind the hub");
                }
                TurnStep::Closed => {
                    result.outcome = TurnOutcome::Failed("event hub closed".to_string());
                    break;
                }
                TurnStep::Event(event) => {
                    if event.session_id != ctx.session_id {
                        continue;
                    }
                    self.route_event(ctx, &event).await;
                    match &event.payload {
                        EventPayload::MessageComplete { text, .. }
                            if !event.scope.is_delegate() =>
                        {
                            result.text.push_str(text);
                            result.text.push('\n');
                        }
                        EventPayload::ToolStart { name, .. } => {
                            *result.tools_used.entry(name.clone()).or_insert(0) += 1;
                        }
                        EventPayload::SessionError { message }
                            if !event.scope.is_delegate() =>
                        {
                            result.errors.push(message.clone());
                        }
                        EventPayload::Usage { usage } => result.usage = Some(*usage),
                        _ => {}
                    }
                    if !event.scope.is_delegate() && event.ends_turn() {
                        result.outcome = match &event.payload {
                            EventPayload::SessionError { message } => {
                                TurnOutcome::Failed(message.clone())
                            }
                            _ => TurnOutcome::Completed,
                        };
                        break;
                    }
                }
            }
        }
        self.sessions.finish_turn(&token).await;
        Ok(result)
    }

    /// Consume already-buffered events until the stream stays quiet for the
    /// given window. Keeps dispatcher and store state exact across interrupt
    /// acknowledgements and trailing delegate events.
    async fn drain_settled(&self, ctx: &mut RunCtx, quiet: Duration) {
        loop {
            let step = tokio::time::timeout(quiet, ctx.rx.recv()).await;
            match step {
                Ok(Ok(event)) => {
                    if event.session_id != ctx.session_id {
                        continue;
                    }
                    self.route_event(ctx, &event).await;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "run receiver lagged while settling");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }
    }

    async fn route_event(&self, ctx: &RunCtx, event: &AgentEvent) {
        ctx.dispatcher.observe(event).await;
        if let Err(err) = ctx.router.handle(event).await {
            tracing::warn!(error = %err, "task routing failed");
        }
        if let EventPayload::SubagentComplete {
            delegate_id,
            status,
            ..
        } = &event.payload
        {
            self.emit(WorkflowEvent::DelegateResolved {
                run_id: self.run.run_id.clone(),
                delegate_id: delegate_id.clone(),
                status: *status,
                timestamp: Utc::now(),
            })
            .await;
        }
    }

    /// Interrupt every active delegate, checkpoint the exact position, and
    /// finish the run as cancelled.
    async fn handle_cancellation(&mut self, ctx: &mut RunCtx) -> Result<()> {
        tracing::info!(run_id = %self.run.run_id, "cancellation requested");
        let interrupted = ctx.dispatcher.interrupt_all().await;
        if interrupted > 0 {
            for handle in ctx.dispatcher.handles().await {
                if handle.status == DelegateStatus::Interrupted {
                    self.emit(WorkflowEvent::DelegateResolved {
                        run_id: self.run.run_id.clone(),
                        delegate_id: handle.id.clone(),
                        status: DelegateStatus::Interrupted,
                        timestamp: Utc::now(),
                    })
                    .await;
                }
            }
        }
        self.drain_settled(ctx, SETTLE_WINDOW).await;
        self.checkpoint().await?;
        self.finish(TerminalOutcome::Cancelled).await
    }

    async fn finish(&mut self, outcome: TerminalOutcome) -> Result<()> {
        let from = self.run.phase;
        self.run.phase = WorkflowPhase::Terminal;
        self.run.terminal = Some(outcome);
        self.run.ended_at = Some(Utc::now());
        self.emit(WorkflowEvent::PhaseChanged {
            run_id: self.run.run_id.clone(),
            from,
            to: WorkflowPhase::Terminal,
            iteration: self.run.iteration,
            timestamp: Utc::now(),
        })
        .await;
        self.emit(WorkflowEvent::RunFinished {
            run_id: self.run.run_id.clone(),
            outcome,
            checkpoint_path: self.run.checkpoint_path.clone(),
            timestamp: Utc::now(),
        })
        .await;
        self.push_state().await?;
        tracing::info!(run_id = %self.run.run_id, outcome = ?outcome, "run finished");
        if let Some(session_id) = self.run.session_id.clone() {
            if let Err(err) = self.sessions.destroy(&session_id).await {
                tracing::warn!(session_id, error = %err, "session teardown failed");
            }
        }
        Ok(())
    }

    async fn set_phase(&mut self, to: WorkflowPhase) -> Result<()> {
        let from = self.run.phase;
        if from == to {
            return Ok(());
        }
        self.run.phase = to;
        tracing::info!(run_id = %self.run.run_id, from = ?from, to = ?to, "phase change");
        self.emit(WorkflowEvent::PhaseChanged {
            run_id: self.run.run_id.clone(),
            from,
            to,
            iteration: self.run.iteration,
            timestamp: Utc::now(),
        })
        .await;
        self.push_state().await
    }

    /// Snapshot of the run position: phase, counters, and the ids of every
    /// task not yet completed.
    async fn checkpoint(&mut self) -> Result<()> {
        let tasks = self.store.load().await?;
        let remaining: Vec<String> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let checkpoint = Checkpoint {
            run_id: self.run.run_id.clone(),
            phase: self.run.phase,
            iteration: self.run.iteration,
            review_iteration: self.run.review_iteration,
            remaining_task_ids: remaining,
            session_id: self.run.session_id.clone(),
            objective: self.run.objective.clone(),
            created_at: Utc::now(),
        };
        self.run_store.save_checkpoint(&checkpoint).await?;
        let path = self.run_store.checkpoint_path().display().to_string();
        self.run.checkpoint_path = Some(path.clone());
        self.emit(WorkflowEvent::CheckpointSaved {
            run_id: self.run.run_id.clone(),
            path,
            iteration: self.run.iteration,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn push_state(&self) -> Result<()> {
        self.run_store.save_run(&self.run).await?;
        let _ = self.state.send(self.run.clone());
        Ok(())
    }

    /// Every workflow event goes to the persistent log and the broadcast
    /// feed; neither failing observers nor a full log stop the run.
    async fn emit(&self, event: WorkflowEvent) {
        if let Err(err) = self.run_store.append_event(&event).await {
            tracing::warn!(error = %err, "workflow event log append failed");
        }
        let _ = self.events.send(event);
    }
}
