// Mock Backend
// Scripted adapter for exercising the facade, dispatcher, and workflow
// without a real agent. Turns and delegate runs are queued up front and
// played back inline, so tests stay deterministic without sleeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use convoy_types::{
    ContextUsage, DelegateStatus, DelegateTask, EventPayload, EventScope, SessionConfig, Task,
    ToolRegistration,
};

use crate::normalize::Emitter;
use crate::{AdapterCapabilities, BackendAdapter, ProviderError, Result};

/// How a scripted turn resolves.
#[derive(Debug, Clone)]
pub enum TurnEnd {
    Idle,
    Error(String),
    /// Emit the scripted events but never resolve; the turn ends only via
    /// interrupt or deadline.
    Hang,
}

/// One scripted assistant turn.
#[derive(Debug, Clone)]
pub struct MockTurn {
    pub emits: Vec<MockEmit>,
    pub end: TurnEnd,
}

impl MockTurn {
    pub fn idle(emits: Vec<MockEmit>) -> Self {
        Self {
            emits,
            end: TurnEnd::Idle,
        }
    }

    pub fn error(emits: Vec<MockEmit>, message: impl Into<String>) -> Self {
        Self {
            emits,
            end: TurnEnd::Error(message.into()),
        }
    }

    pub fn hang(emits: Vec<MockEmit>) -> Self {
        Self {
            emits,
            end: TurnEnd::Hang,
        }
    }
}

/// A single scripted emission within a turn.
#[derive(Debug, Clone)]
pub enum MockEmit {
    /// A whole assistant message.
    Text(String),
    /// A paired `update_tasks` tool invocation carrying the new task list.
    TaskUpdate(Vec<Task>),
    /// A paired invocation of an arbitrary tool.
    Tool {
        name: String,
        arguments: Value,
        output: Value,
    },
    /// A model-initiated delegate span played inline.
    Subagent {
        task: Option<String>,
        events: Vec<MockEmit>,
        status: DelegateStatus,
        summary: Option<String>,
    },
    /// A permission prompt surfaced mid-turn.
    Permission { tool: String },
    Usage(ContextUsage),
}

/// Scripted behavior for one `spawn_delegate` call.
#[derive(Debug, Clone)]
pub struct MockDelegateScript {
    pub events: Vec<MockEmit>,
    pub status: DelegateStatus,
    pub summary: Option<String>,
}

impl MockDelegateScript {
    pub fn completed(events: Vec<MockEmit>, summary: impl Into<String>) -> Self {
        Self {
            events,
            status: DelegateStatus::Completed,
            summary: Some(summary.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            status: DelegateStatus::Error,
            summary: Some(message.into()),
        }
    }
}

#[derive(Default)]
struct MockState {
    turns: Mutex<VecDeque<MockTurn>>,
    delegate_scripts: Mutex<VecDeque<MockDelegateScript>>,
    sessions: Mutex<HashSet<String>>,
    prompts: Mutex<Vec<(String, String)>>,
    interrupts: Mutex<Vec<String>>,
    registrations: Mutex<Vec<(String, ToolRegistration)>>,
    resumed: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    delegates: Mutex<Vec<(String, DelegateTask)>>,
    usages: Mutex<HashMap<String, ContextUsage>>,
    missing_resumes: Mutex<HashSet<String>>,
    fail_next_send: AtomicUsize,
    session_counter: AtomicUsize,
    delegate_counter: AtomicUsize,
    call_counter: AtomicUsize,
    permission_counter: AtomicUsize,
}

pub struct MockBackend {
    emitter: Arc<Emitter>,
    capabilities: AdapterCapabilities,
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self {
            emitter,
            capabilities: AdapterCapabilities {
                supports_structural_delegation: true,
                supports_resume: true,
            },
            state: Arc::new(MockState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: AdapterCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn push_turn(&self, turn: MockTurn) {
        self.state.turns.lock().await.push_back(turn);
    }

    pub async fn push_delegate_script(&self, script: MockDelegateScript) {
        self.state.delegate_scripts.lock().await.push_back(script);
    }

    /// Make the next `count` sends fail with a recoverable transport error.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.fail_next_send.store(count, Ordering::SeqCst);
    }

    /// Make resume of the given id report an unknown session.
    pub async fn mark_resume_missing(&self, session_id: &str) {
        self.state
            .missing_resumes
            .lock()
            .await
            .insert(session_id.to_string());
    }

    pub async fn prompts(&self) -> Vec<(String, String)> {
        self.state.prompts.lock().await.clone()
    }

    pub async fn interrupts(&self) -> Vec<String> {
        self.state.interrupts.lock().await.clone()
    }

    pub async fn registrations(&self) -> Vec<(String, ToolRegistration)> {
        self.state.registrations.lock().await.clone()
    }

    pub async fn resumed(&self) -> Vec<String> {
        self.state.resumed.lock().await.clone()
    }

    pub async fn destroyed(&self) -> Vec<String> {
        self.state.destroyed.lock().await.clone()
    }

    pub async fn spawned_delegates(&self) -> Vec<(String, DelegateTask)> {
        self.state.delegates.lock().await.clone()
    }

    async fn require_session(&self, session_id: &str) -> Result<()> {
        if self.state.sessions.lock().await.contains(session_id) {
            Ok(())
        } else {
            Err(ProviderError::UnknownSession(session_id.to_string()))
        }
    }

    async fn play(&self, session_id: &str, scope: &EventScope, emit: MockEmit) {
        match emit {
            MockEmit::Subagent {
                task,
                events,
                status,
                summary,
            } => {
                let n = self.state.delegate_counter.fetch_add(1, Ordering::SeqCst);
                let delegate_id = format!("dlg_{}", n);
                let delegate_scope = EventScope::delegate(&delegate_id);
                self.emitter
                    .emit(
                        session_id,
                        delegate_scope.clone(),
                        EventPayload::SubagentStart {
                            delegate_id: delegate_id.clone(),
                            task,
                        },
                    )
                    .await;
                for event in events {
                    self.play_shallow(session_id, &delegate_scope, event).await;
                }
                self.emitter
                    .emit(
                        session_id,
                        delegate_scope,
                        EventPayload::SubagentComplete {
                            delegate_id,
                            status,
                            summary,
                        },
                    )
                    .await;
            }
            leaf => self.play_leaf(session_id, scope, leaf).await,
        }
    }

    /// Scripts support one level of delegate nesting; anything deeper is
    /// dropped.
    async fn play_shallow(&self, session_id: &str, scope: &EventScope, emit: MockEmit) {
        match emit {
            MockEmit::Subagent { .. } => {
                tracing::debug!("mock script nested a delegate inside a delegate; skipping");
            }
            leaf => self.play_leaf(session_id, scope, leaf).await,
        }
    }

    async fn play_leaf(&self, session_id: &str, scope: &EventScope, emit: MockEmit) {
        match emit {
            MockEmit::Text(text) => {
                self.emitter
                    .emit(
                        session_id,
                        scope.clone(),
                        EventPayload::MessageComplete {
                            message_id: None,
                            text,
                        },
                    )
                    .await;
            }
            MockEmit::TaskUpdate(tasks) => {
                self.play_tool(
                    session_id,
                    scope,
                    "update_tasks".to_string(),
                    json!({ "tasks": tasks }),
                    json!({ "ok": true }),
                )
                .await;
            }
            MockEmit::Tool {
                name,
                arguments,
                output,
            } => {
                self.play_tool(session_id, scope, name, arguments, output)
                    .await;
            }
            MockEmit::Subagent { .. } => {}
            MockEmit::Permission { tool } => {
                let n = self.state.permission_counter.fetch_add(1, Ordering::SeqCst);
                self.emitter
                    .emit(
                        session_id,
                        scope.clone(),
                        EventPayload::PermissionRequested {
                            request_id: format!("perm_{}", n),
                            tool,
                            arguments: Value::Null,
                        },
                    )
                    .await;
            }
            MockEmit::Usage(usage) => {
                self.state
                    .usages
                    .lock()
                    .await
                    .insert(session_id.to_string(), usage);
                self.emitter
                    .emit(session_id, scope.clone(), EventPayload::Usage { usage })
                    .await;
            }
        }
    }

    async fn play_tool(
        &self,
        session_id: &str,
        scope: &EventScope,
        name: String,
        arguments: Value,
        output: Value,
    ) {
        let n = self.state.call_counter.fetch_add(1, Ordering::SeqCst);
        let call_id = format!("mock_call_{}", n);
        self.emitter
            .emit(
                session_id,
                scope.clone(),
                EventPayload::ToolStart {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            )
            .await;
        self.emitter
            .emit(
                session_id,
                scope.clone(),
                EventPayload::ToolComplete {
                    call_id,
                    name,
                    arguments,
                    output: Some(output),
                    error: None,
                },
            )
            .await;
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn id(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn create_session(&self, _config: SessionConfig) -> Result<String> {
        let n = self.state.session_counter.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("mock_{}", n);
        self.state.sessions.lock().await.insert(session_id.clone());
        self.emitter
            .emit(
                &session_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "mock".to_string(),
                    resumed: false,
                },
            )
            .await;
        Ok(session_id)
    }

    async fn resume_session(&self, session_id: &str, _config: SessionConfig) -> Result<String> {
        if self.state.missing_resumes.lock().await.contains(session_id) {
            return Err(ProviderError::UnknownSession(session_id.to_string()));
        }
        self.state
            .sessions
            .lock()
            .await
            .insert(session_id.to_string());
        self.state
            .resumed
            .lock()
            .await
            .push(session_id.to_string());
        self.emitter
            .emit(
                session_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "mock".to_string(),
                    resumed: true,
                },
            )
            .await;
        Ok(session_id.to_string())
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        self.require_session(session_id).await?;
        self.state
            .prompts
            .lock()
            .await
            .push((session_id.to_string(), prompt.to_string()));

        let remaining = self.state.fail_next_send.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .fail_next_send
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transport(
                "injected send failure".to_string(),
            ));
        }

        let turn = self
            .state
            .turns
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| MockTurn::idle(Vec::new()));

        // Playback happens before returning; subscribers that attached
        // before the prompt observe everything in order.
        for emit in turn.emits {
            self.play(session_id, &EventScope::TopLevel, emit).await;
        }
        match turn.end {
            TurnEnd::Idle => {
                self.emitter
                    .emit(session_id, EventScope::TopLevel, EventPayload::SessionIdle {})
                    .await;
            }
            TurnEnd::Error(message) => {
                self.emitter
                    .emit(
                        session_id,
                        EventScope::TopLevel,
                        EventPayload::SessionError { message },
                    )
                    .await;
            }
            TurnEnd::Hang => {}
        }
        Ok(())
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.require_session(session_id).await?;
        self.state
            .interrupts
            .lock()
            .await
            .push(session_id.to_string());
        // The backend acknowledges an abort by going idle.
        self.emitter
            .emit(session_id, EventScope::TopLevel, EventPayload::SessionIdle {})
            .await;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        self.state.sessions.lock().await.remove(session_id);
        self.state
            .destroyed
            .lock()
            .await
            .push(session_id.to_string());
        self.emitter.forget_session(session_id).await;
        Ok(())
    }

    async fn register_tool(&self, session_id: &str, tool: ToolRegistration) -> Result<()> {
        self.require_session(session_id).await?;
        self.state
            .registrations
            .lock()
            .await
            .push((session_id.to_string(), tool));
        Ok(())
    }

    async fn spawn_delegate(&self, session_id: &str, task: DelegateTask) -> Result<String> {
        self.require_session(session_id).await?;
        if !self.capabilities.supports_structural_delegation {
            return Err(ProviderError::Unsupported(
                "structural delegation".to_string(),
            ));
        }
        let n = self.state.delegate_counter.fetch_add(1, Ordering::SeqCst);
        let delegate_id = format!("dlg_{}", n);
        self.state
            .delegates
            .lock()
            .await
            .push((delegate_id.clone(), task.clone()));

        let script = self
            .state
            .delegate_scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| MockDelegateScript::completed(Vec::new(), "done"));

        let scope = EventScope::delegate(&delegate_id);
        self.emitter
            .emit(
                session_id,
                scope.clone(),
                EventPayload::SubagentStart {
                    delegate_id: delegate_id.clone(),
                    task: Some(task.description.clone()),
                },
            )
            .await;
        for emit in script.events {
            self.play_shallow(session_id, &scope, emit).await;
        }
        self.emitter
            .emit(
                session_id,
                scope,
                EventPayload::SubagentComplete {
                    delegate_id: delegate_id.clone(),
                    status: script.status,
                    summary: script.summary,
                },
            )
            .await;
        Ok(delegate_id)
    }

    async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>> {
        Ok(self.state.usages.lock().await.get(session_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::{AgentEvent, EventKind};
    use tokio::sync::broadcast;

    fn backend_fixture() -> (MockBackend, broadcast::Receiver<AgentEvent>) {
        let (tx, rx) = broadcast::channel(256);
        (MockBackend::new(Arc::new(Emitter::new(tx))), rx)
    }

    async fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn scripted_turn_plays_in_order_then_idles() {
        let (backend, mut rx) = backend_fixture();
        backend
            .push_turn(MockTurn::idle(vec![
                MockEmit::Text("working on it".to_string()),
                MockEmit::Tool {
                    name: "read_file".to_string(),
                    arguments: json!({ "path": "src/lib.rs" }),
                    output: json!("contents"),
                },
            ]))
            .await;

        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        backend.send_prompt(&session_id, "go").await.unwrap();

        let kinds: Vec<EventKind> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SessionStart,
                EventKind::MessageComplete,
                EventKind::ToolStart,
                EventKind::ToolComplete,
                EventKind::SessionIdle,
            ]
        );
        assert_eq!(backend.prompts().await.len(), 1);
    }

    #[tokio::test]
    async fn task_update_rides_a_paired_tool_call() {
        let (backend, mut rx) = backend_fixture();
        backend
            .push_turn(MockTurn::idle(vec![MockEmit::TaskUpdate(vec![
                Task::new("t1", "write the parser"),
                Task::new("t2", "write the tests"),
            ])]))
            .await;

        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        backend.send_prompt(&session_id, "plan").await.unwrap();

        let events = drain(&mut rx).await;
        let complete = events
            .iter()
            .find(|e| e.kind() == EventKind::ToolComplete)
            .expect("tool.complete present");
        match &complete.payload {
            EventPayload::ToolComplete {
                name, arguments, ..
            } => {
                assert_eq!(name, "update_tasks");
                assert_eq!(arguments["tasks"].as_array().map(|a| a.len()), Some(2));
            }
            other => panic!("expected tool.complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn injected_send_failure_is_recoverable_and_transient() {
        let (backend, _rx) = backend_fixture();
        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        backend.fail_next_sends(1);

        let error = backend.send_prompt(&session_id, "go").await.unwrap_err();
        assert!(error.is_recoverable());
        backend.send_prompt(&session_id, "go").await.unwrap();
        assert_eq!(backend.prompts().await.len(), 2);
    }

    #[tokio::test]
    async fn delegate_script_plays_under_delegate_scope() {
        let (backend, mut rx) = backend_fixture();
        backend
            .push_delegate_script(MockDelegateScript::completed(
                vec![MockEmit::Text("poking around".to_string())],
                "found it",
            ))
            .await;

        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        let delegate_id = backend
            .spawn_delegate(&session_id, DelegateTask::new("find the bug"))
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let scoped: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| e.scope == EventScope::delegate(&delegate_id))
            .collect();
        assert_eq!(scoped.len(), 3);
        assert_eq!(scoped[0].kind(), EventKind::SubagentStart);
        assert_eq!(scoped[1].kind(), EventKind::MessageComplete);
        assert_eq!(scoped[2].kind(), EventKind::SubagentComplete);
    }

    #[tokio::test]
    async fn interrupt_acknowledges_with_idle() {
        let (backend, mut rx) = backend_fixture();
        backend
            .push_turn(MockTurn::hang(vec![MockEmit::Text("stuck".to_string())]))
            .await;

        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        backend.send_prompt(&session_id, "go").await.unwrap();
        let before: Vec<EventKind> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert!(!before.contains(&EventKind::SessionIdle));

        backend.interrupt(&session_id).await.unwrap();
        let after: Vec<EventKind> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(after, vec![EventKind::SessionIdle]);
        assert_eq!(backend.interrupts().await, vec![session_id]);
    }

    #[tokio::test]
    async fn structural_delegation_respects_capabilities() {
        let (tx, _rx) = broadcast::channel(64);
        let backend = MockBackend::new(Arc::new(Emitter::new(tx))).with_capabilities(
            AdapterCapabilities {
                supports_structural_delegation: false,
                supports_resume: true,
            },
        );
        let session_id = backend.create_session(SessionConfig::default()).await.unwrap();
        let error = backend
            .spawn_delegate(&session_id, DelegateTask::new("anything"))
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Unsupported(_)));
    }
}
