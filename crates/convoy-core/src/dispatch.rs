// Sub-agent Dispatcher
// Fans work out to delegates over whichever primitive the backend offers.
// Structural dispatch uses the native spawn primitive and gets a stable id
// up front; instructional dispatch injects a directive into the parent turn
// and claims the sub-agent once it surfaces in the event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use convoy_providers::BackendAdapter;
use convoy_types::{
    AgentEvent, DelegateHandle, DelegateKind, DelegateStatus, DelegateTask, EventPayload,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ConvoyError, Result};

const DEFAULT_PENDING_DEADLINE: Duration = Duration::from_secs(120);
const DEFAULT_MAX_PARALLEL: usize = 4;

/// How delegate activity feeds back into run accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingPolicy {
    /// Apply task-tool calls made inside delegate scopes to the store.
    pub reconcile_delegate_tools: bool,
    /// Count background delegates as unresolved work.
    pub count_background_delegates: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            reconcile_delegate_tools: true,
            count_background_delegates: false,
        }
    }
}

/// What a dispatch produced.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Backend accepted a native spawn; the id is final.
    Structural { delegate_id: String },
    /// No native primitive: the directive must ride the next parent prompt,
    /// and the id is a placeholder until a sub-agent is attributed.
    Instructional { delegate_id: String, directive: String },
}

impl Dispatch {
    pub fn delegate_id(&self) -> &str {
        match self {
            Dispatch::Structural { delegate_id } => delegate_id,
            Dispatch::Instructional { delegate_id, .. } => delegate_id,
        }
    }
}

struct DispatchInner {
    handles: HashMap<String, DelegateHandle>,
    /// Placeholder ids of instructional dispatches awaiting attribution,
    /// oldest first.
    pending_queue: VecDeque<String>,
    deadlines: HashMap<String, Instant>,
}

/// Tracks every delegate of one session, whichever way it was started.
pub struct DelegateDispatcher {
    adapter: Arc<dyn BackendAdapter>,
    session_id: String,
    policy: RoutingPolicy,
    pending_deadline: Duration,
    max_parallel: usize,
    delegate_tool: String,
    placeholder_counter: AtomicU64,
    state: Mutex<DispatchInner>,
}

impl DelegateDispatcher {
    pub fn new(adapter: Arc<dyn BackendAdapter>, session_id: impl Into<String>) -> Self {
        Self {
            adapter,
            session_id: session_id.into(),
            policy: RoutingPolicy::default(),
            pending_deadline: DEFAULT_PENDING_DEADLINE,
            max_parallel: DEFAULT_MAX_PARALLEL,
            delegate_tool: "delegate".to_string(),
            placeholder_counter: AtomicU64::new(0),
            state: Mutex::new(DispatchInner {
                handles: HashMap::new(),
                pending_queue: VecDeque::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long an instructional dispatch may wait for attribution.
    pub fn with_pending_deadline(mut self, deadline: Duration) -> Self {
        self.pending_deadline = deadline;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Name of the registered delegation tool referenced by instructional
    /// directives.
    pub fn with_delegate_tool(mut self, name: impl Into<String>) -> Self {
        self.delegate_tool = name.into();
        self
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Hand a task to a sub-agent, picking the dispatch kind the backend
    /// supports.
    pub async fn dispatch(&self, task: DelegateTask) -> Result<Dispatch> {
        if !self.has_capacity().await {
            return Err(ConvoyError::InvalidOperation(format!(
                "delegate capacity ({}) exhausted",
                self.max_parallel
            )));
        }

        if self.adapter.capabilities().supports_structural_delegation {
            let delegate_id = self
                .adapter
                .spawn_delegate(&self.session_id, task.clone())
                .await?;
            let handle = DelegateHandle::new(&delegate_id, DelegateKind::Structural, task);
            tracing::info!(
                session_id = %self.session_id,
                delegate_id,
                "structural delegate dispatched"
            );
            self.state
                .lock()
                .await
                .handles
                .insert(delegate_id.clone(), handle);
            return Ok(Dispatch::Structural { delegate_id });
        }

        let n = self.placeholder_counter.fetch_add(1, Ordering::SeqCst);
        let placeholder = format!("pending_{}", n);
        let directive = format!(
            "Use the `{}` tool to hand this work to a sub-agent now: {} \
             Wait for the sub-agent to finish and fold its outcome into your progress.",
            self.delegate_tool, task.description
        );
        let handle = DelegateHandle::new(&placeholder, DelegateKind::Instructional, task);
        let mut state = self.state.lock().await;
        state.handles.insert(placeholder.clone(), handle);
        state.pending_queue.push_back(placeholder.clone());
        state
            .deadlines
            .insert(placeholder.clone(), Instant::now() + self.pending_deadline);
        tracing::info!(
            session_id = %self.session_id,
            delegate_id = %placeholder,
            "instructional delegate queued"
        );
        Ok(Dispatch::Instructional {
            delegate_id: placeholder,
            directive,
        })
    }

    /// Feed one canonical event through the attribution state machine.
    pub async fn observe(&self, event: &AgentEvent) {
        match &event.payload {
            EventPayload::SubagentStart { delegate_id, task } => {
                let mut state = self.state.lock().await;
                if let Some(handle) = state.handles.get_mut(delegate_id) {
                    handle.status = DelegateStatus::Running;
                    return;
                }
                // Unattributed start: the oldest pending instructional
                // dispatch claims it.
                while let Some(placeholder) = state.pending_queue.pop_front() {
                    let Some(mut handle) = state.handles.remove(&placeholder) else {
                        continue;
                    };
                    if handle.status != DelegateStatus::Pending {
                        state.handles.insert(placeholder, handle);
                        continue;
                    }
                    state.deadlines.remove(&placeholder);
                    handle.id = delegate_id.clone();
                    handle.status = DelegateStatus::Running;
                    tracing::info!(
                        delegate_id,
                        placeholder = %placeholder,
                        "sub-agent attributed to pending dispatch"
                    );
                    state.handles.insert(delegate_id.clone(), handle);
                    return;
                }
                // Model-initiated: adopt it so its resolution is tracked.
                let mut handle = DelegateHandle::new(
                    delegate_id,
                    DelegateKind::Structural,
                    DelegateTask::new(task.clone().unwrap_or_default()),
                );
                handle.status = DelegateStatus::Running;
                tracing::debug!(delegate_id, "adopted model-initiated sub-agent");
                state.handles.insert(delegate_id.clone(), handle);
            }
            EventPayload::SubagentComplete {
                delegate_id,
                status,
                summary,
            } => {
                let mut state = self.state.lock().await;
                let Some(handle) = state.handles.get_mut(delegate_id) else {
                    tracing::debug!(delegate_id, "completion for unknown delegate");
                    return;
                };
                // An interrupted delegate stays interrupted even if a
                // straggling completion arrives afterwards.
                if handle.status == DelegateStatus::Interrupted {
                    return;
                }
                handle.status = *status;
                handle.summary = summary.clone();
                if *status == DelegateStatus::Error && handle.error.is_none() {
                    handle.error = summary.clone();
                }
            }
            _ => {}
        }
    }

    /// Flip pending instructional dispatches past their deadline to errored
    /// and return their ids. The bound tasks were never claimed, so they stay
    /// actionable for the next iteration.
    pub async fn expire_pending(&self) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let due: Vec<String> = state
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired = Vec::new();
        for id in due {
            state.deadlines.remove(&id);
            let Some(handle) = state.handles.get_mut(&id) else {
                continue;
            };
            if handle.status != DelegateStatus::Pending {
                continue;
            }
            handle.status = DelegateStatus::Error;
            handle.error = Some(
                "delegation uncertain: no sub-agent observed within the deadline".to_string(),
            );
            tracing::warn!(delegate_id = %id, "instructional delegation expired unattributed");
            expired.push(id);
        }
        expired
    }

    /// Mark every pending or running delegate interrupted and abort the
    /// session once. Interrupted is final for these handles.
    pub async fn interrupt_all(&self) -> usize {
        let count = {
            let mut state = self.state.lock().await;
            let mut count = 0;
            for handle in state.handles.values_mut() {
                if matches!(
                    handle.status,
                    DelegateStatus::Pending | DelegateStatus::Running
                ) {
                    handle.status = DelegateStatus::Interrupted;
                    count += 1;
                }
            }
            count
        };
        if count > 0 {
            tracing::info!(
                session_id = %self.session_id,
                interrupted = count,
                "interrupting active delegates"
            );
            if let Err(err) = self.adapter.interrupt(&self.session_id).await {
                tracing::warn!(error = %err, "delegate interrupt failed");
            }
        }
        count
    }

    /// Store task bound to the given delegate, if the dispatch targeted one.
    pub async fn bound_task(&self, delegate_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .handles
            .get(delegate_id)
            .and_then(|handle| handle.task.task_id.clone())
    }

    pub async fn handle(&self, delegate_id: &str) -> Option<DelegateHandle> {
        self.state.lock().await.handles.get(delegate_id).cloned()
    }

    /// Snapshot of every tracked delegate, oldest first.
    pub async fn handles(&self) -> Vec<DelegateHandle> {
        let state = self.state.lock().await;
        let mut handles: Vec<DelegateHandle> = state.handles.values().cloned().collect();
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        handles
    }

    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .handles
            .values()
            .filter(|h| h.status == DelegateStatus::Running)
            .count()
    }

    /// Delegates still standing between the run and convergence. Background
    /// delegates only count when the policy says so.
    pub async fn unresolved_count(&self) -> usize {
        self.state
            .lock()
            .await
            .handles
            .values()
            .filter(|h| match h.status {
                DelegateStatus::Pending | DelegateStatus::Running => true,
                DelegateStatus::Background => self.policy.count_background_delegates,
                _ => false,
            })
            .count()
    }

    pub async fn has_capacity(&self) -> bool {
        let active = self
            .state
            .lock()
            .await
            .handles
            .values()
            .filter(|h| {
                matches!(
                    h.status,
                    DelegateStatus::Pending | DelegateStatus::Running
                )
            })
            .count();
        active < self.max_parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use convoy_providers::{AdapterCapabilities, MockBackend, MockDelegateScript, MockEmit};
    use convoy_types::{EventScope, SessionConfig};

    fn subagent_start(session_id: &str, delegate_id: &str) -> AgentEvent {
        AgentEvent {
            session_id: session_id.to_string(),
            sequence: 1,
            timestamp: chrono::Utc::now(),
            scope: EventScope::delegate(delegate_id),
            payload: EventPayload::SubagentStart {
                delegate_id: delegate_id.to_string(),
                task: None,
            },
        }
    }

    fn subagent_complete(
        session_id: &str,
        delegate_id: &str,
        status: DelegateStatus,
    ) -> AgentEvent {
        AgentEvent {
            session_id: session_id.to_string(),
            sequence: 2,
            timestamp: chrono::Utc::now(),
            scope: EventScope::delegate(delegate_id),
            payload: EventPayload::SubagentComplete {
                delegate_id: delegate_id.to_string(),
                status,
                summary: Some("done".to_string()),
            },
        }
    }

    async fn structural_fixture() -> (EventHub, Arc<MockBackend>, String) {
        let hub = EventHub::new();
        let mock = Arc::new(MockBackend::new(hub.emitter()));
        let session_id = mock
            .create_session(SessionConfig::default())
            .await
            .expect("session");
        (hub, mock, session_id)
    }

    #[tokio::test]
    async fn structural_dispatch_follows_events_to_completion() {
        let (hub, mock, session_id) = structural_fixture().await;
        let mut rx = hub.subscribe();
        mock.push_delegate_script(MockDelegateScript::completed(
            vec![MockEmit::Text("digging".to_string())],
            "patched the parser",
        ))
        .await;

        let dispatcher = DelegateDispatcher::new(mock.clone(), &session_id);
        let dispatch = dispatcher
            .dispatch(DelegateTask::for_task("t1", "patch the parser"))
            .await
            .expect("dispatch");
        let delegate_id = dispatch.delegate_id().to_string();
        assert!(matches!(dispatch, Dispatch::Structural { .. }));
        assert_eq!(dispatcher.bound_task(&delegate_id).await.as_deref(), Some("t1"));

        while let Ok(event) = rx.try_recv() {
            dispatcher.observe(&event).await;
        }
        let handle = dispatcher.handle(&delegate_id).await.expect("handle");
        assert_eq!(handle.status, DelegateStatus::Completed);
        assert_eq!(handle.summary.as_deref(), Some("patched the parser"));
        assert_eq!(dispatcher.unresolved_count().await, 0);
    }

    #[tokio::test]
    async fn instructional_claims_go_to_the_oldest_pending() {
        let hub = EventHub::new();
        let mock = Arc::new(MockBackend::new(hub.emitter()).with_capabilities(
            AdapterCapabilities {
                supports_structural_delegation: false,
                supports_resume: true,
            },
        ));
        let session_id = mock
            .create_session(SessionConfig::default())
            .await
            .expect("session");
        let dispatcher = DelegateDispatcher::new(mock, &session_id);

        let first = dispatcher
            .dispatch(DelegateTask::for_task("t1", "first task"))
            .await
            .expect("first");
        let second = dispatcher
            .dispatch(DelegateTask::for_task("t2", "second task"))
            .await
            .expect("second");
        let Dispatch::Instructional { directive, .. } = &first else {
            panic!("expected instructional dispatch");
        };
        assert!(directive.contains("first task"));
        assert!(directive.contains("`delegate`"));

        // The first sub-agent to surface belongs to the older dispatch.
        dispatcher
            .observe(&subagent_start(&session_id, "agent_a"))
            .await;
        assert_eq!(dispatcher.bound_task("agent_a").await.as_deref(), Some("t1"));
        assert!(dispatcher.handle(first.delegate_id()).await.is_none());

        dispatcher
            .observe(&subagent_start(&session_id, "agent_b"))
            .await;
        assert_eq!(dispatcher.bound_task("agent_b").await.as_deref(), Some("t2"));
        assert!(dispatcher.handle(second.delegate_id()).await.is_none());
        assert_eq!(dispatcher.running_count().await, 2);
    }

    #[tokio::test]
    async fn unclaimed_instructional_expires_as_uncertain() {
        let hub = EventHub::new();
        let mock = Arc::new(MockBackend::new(hub.emitter()).with_capabilities(
            AdapterCapabilities {
                supports_structural_delegation: false,
                supports_resume: true,
            },
        ));
        let session_id = mock
            .create_session(SessionConfig::default())
            .await
            .expect("session");
        let dispatcher = DelegateDispatcher::new(mock, &session_id)
            .with_pending_deadline(Duration::from_millis(5));

        let dispatch = dispatcher
            .dispatch(DelegateTask::for_task("t1", "vanishing act"))
            .await
            .expect("dispatch");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let expired = dispatcher.expire_pending().await;
        assert_eq!(expired, vec![dispatch.delegate_id().to_string()]);
        let handle = dispatcher
            .handle(dispatch.delegate_id())
            .await
            .expect("handle");
        assert_eq!(handle.status, DelegateStatus::Error);
        assert!(handle
            .error
            .as_deref()
            .is_some_and(|e| e.contains("delegation uncertain")));

        // A sub-agent surfacing later no longer claims the expired dispatch.
        dispatcher
            .observe(&subagent_start(&session_id, "agent_late"))
            .await;
        let late = dispatcher.handle("agent_late").await.expect("adopted");
        assert_eq!(late.kind, DelegateKind::Structural);
        assert!(late.task.task_id.is_none());
    }

    #[tokio::test]
    async fn interrupted_delegates_are_never_coerced_terminal() {
        let (_hub, mock, session_id) = structural_fixture().await;
        let dispatcher = DelegateDispatcher::new(mock.clone(), &session_id);
        let dispatch = dispatcher
            .dispatch(DelegateTask::new("long running"))
            .await
            .expect("dispatch");
        let delegate_id = dispatch.delegate_id().to_string();
        dispatcher
            .observe(&subagent_start(&session_id, &delegate_id))
            .await;

        assert_eq!(dispatcher.interrupt_all().await, 1);
        assert_eq!(mock.interrupts().await, vec![session_id.clone()]);

        // Straggling completion after the interrupt changes nothing.
        dispatcher
            .observe(&subagent_complete(
                &session_id,
                &delegate_id,
                DelegateStatus::Completed,
            ))
            .await;
        let handle = dispatcher.handle(&delegate_id).await.expect("handle");
        assert_eq!(handle.status, DelegateStatus::Interrupted);
        assert_eq!(dispatcher.interrupt_all().await, 0);
    }

    #[tokio::test]
    async fn background_delegates_follow_the_routing_policy() {
        let (_hub, mock, session_id) = structural_fixture().await;
        let counting = DelegateDispatcher::new(mock.clone(), &session_id).with_policy(
            RoutingPolicy {
                reconcile_delegate_tools: true,
                count_background_delegates: true,
            },
        );
        let silent = DelegateDispatcher::new(mock, &session_id);

        for dispatcher in [&counting, &silent] {
            dispatcher
                .observe(&subagent_start(&session_id, "agent_bg"))
                .await;
            dispatcher
                .observe(&subagent_complete(
                    &session_id,
                    "agent_bg",
                    DelegateStatus::Background,
                ))
                .await;
        }
        assert_eq!(counting.unresolved_count().await, 1);
        assert_eq!(silent.unresolved_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_is_bounded_by_max_parallel() {
        let (_hub, mock, session_id) = structural_fixture().await;
        let dispatcher =
            DelegateDispatcher::new(mock, &session_id).with_max_parallel(2);

        dispatcher
            .dispatch(DelegateTask::new("one"))
            .await
            .expect("one");
        dispatcher
            .dispatch(DelegateTask::new("two"))
            .await
            .expect("two");
        assert!(!dispatcher.has_capacity().await);
        let err = dispatcher
            .dispatch(DelegateTask::new("three"))
            .await
            .expect_err("over capacity");
        assert!(matches!(err, ConvoyError::InvalidOperation(_)));
    }
}
