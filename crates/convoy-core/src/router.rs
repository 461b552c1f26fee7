// Task Event Router
// Watches the canonical stream for task-tool completions and sub-agent
// starts, and folds them into the store through its guarded paths.

use std::sync::Arc;

use convoy_types::{AgentEvent, EventPayload, Task, TaskStatus};

use crate::dispatch::DelegateDispatcher;
use crate::error::{ConvoyError, Result};
use crate::store::TaskStore;

pub const DEFAULT_TASK_TOOL: &str = "update_tasks";

/// Routes task-relevant events into the store. Rejected reconciliations are
/// counted by the store and skipped; only IO-level failures propagate.
pub struct TaskEventRouter {
    store: Arc<TaskStore>,
    dispatcher: Arc<DelegateDispatcher>,
    task_tool: String,
}

impl TaskEventRouter {
    pub fn new(store: Arc<TaskStore>, dispatcher: Arc<DelegateDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            task_tool: DEFAULT_TASK_TOOL.to_string(),
        }
    }

    pub fn with_task_tool(mut self, name: impl Into<String>) -> Self {
        self.task_tool = name.into();
        self
    }

    pub fn task_tool(&self) -> &str {
        &self.task_tool
    }

    pub async fn handle(&self, event: &AgentEvent) -> Result<()> {
        match &event.payload {
            EventPayload::ToolComplete {
                name,
                arguments,
                error,
                ..
            } if name == &self.task_tool => {
                if error.is_some() {
                    tracing::debug!(tool = %name, "task tool call failed, nothing to fold in");
                    return Ok(());
                }
                if event.scope.is_delegate()
                    && !self.dispatcher.policy().reconcile_delegate_tools
                {
                    tracing::debug!(
                        scope = %event.scope,
                        "delegate task update ignored by routing policy"
                    );
                    return Ok(());
                }
                let Some(raw) = arguments.get("tasks") else {
                    tracing::warn!(tool = %name, "task tool call carried no tasks field");
                    return Ok(());
                };
                let updates: Vec<Task> = match serde_json::from_value(raw.clone()) {
                    Ok(updates) => updates,
                    Err(err) => {
                        tracing::warn!(error = %err, "task tool arguments did not parse");
                        return Ok(());
                    }
                };
                match self.store.reconcile(&updates).await {
                    Ok(_) => Ok(()),
                    Err(ConvoyError::TaskReconciliationRejected { unknown_ids }) => {
                        tracing::warn!(
                            unknown_ids = %unknown_ids.join(", "),
                            "task update rejected wholesale"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            EventPayload::SubagentStart { delegate_id, .. } => {
                let Some(task_id) = self.dispatcher.bound_task(delegate_id).await else {
                    return Ok(());
                };
                match self.store.mark_status(&task_id, TaskStatus::InProgress).await {
                    Ok(_) => Ok(()),
                    Err(ConvoyError::TaskReconciliationRejected { unknown_ids }) => {
                        tracing::warn!(
                            delegate_id,
                            unknown_ids = %unknown_ids.join(", "),
                            "bound task is not in the store"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RoutingPolicy;
    use crate::hub::EventHub;
    use convoy_providers::{BackendAdapter, MockBackend};
    use convoy_types::{DelegateTask, EventScope, SessionConfig};
    use serde_json::json;
    use tempfile::TempDir;

    async fn router_fixture(
        dir: &TempDir,
        policy: RoutingPolicy,
    ) -> (TaskEventRouter, Arc<TaskStore>, Arc<DelegateDispatcher>, String) {
        let hub = EventHub::new();
        let mock = Arc::new(MockBackend::new(hub.emitter()));
        let session_id = mock
            .create_session(SessionConfig::default())
            .await
            .expect("session");
        let store = Arc::new(TaskStore::new(dir.path().join("tasks.json")));
        let dispatcher =
            Arc::new(DelegateDispatcher::new(mock, &session_id).with_policy(policy));
        let router = TaskEventRouter::new(store.clone(), dispatcher.clone());
        (router, store, dispatcher, session_id)
    }

    fn task_update_event(session_id: &str, scope: EventScope, tasks: serde_json::Value) -> AgentEvent {
        AgentEvent {
            session_id: session_id.to_string(),
            sequence: 1,
            timestamp: chrono::Utc::now(),
            scope,
            payload: EventPayload::ToolComplete {
                call_id: "call_1".to_string(),
                name: DEFAULT_TASK_TOOL.to_string(),
                arguments: json!({ "tasks": tasks }),
                output: Some(json!({ "ok": true })),
                error: None,
            },
        }
    }

    #[tokio::test]
    async fn task_tool_completions_reconcile_the_store() {
        let dir = TempDir::new().expect("tempdir");
        let (router, store, _dispatcher, session_id) =
            router_fixture(&dir, RoutingPolicy::default()).await;
        store
            .save(&[Task::new("t1", "write the codec")])
            .await
            .expect("seed");

        let event = task_update_event(
            &session_id,
            EventScope::TopLevel,
            json!([{ "id": "t1", "description": "write the codec", "status": "completed" }]),
        );
        router.handle(&event).await.expect("handled");

        let tasks = store.load().await.expect("load");
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn delegate_scoped_updates_respect_the_policy() {
        let dir = TempDir::new().expect("tempdir");
        let policy = RoutingPolicy {
            reconcile_delegate_tools: false,
            count_background_delegates: false,
        };
        let (router, store, _dispatcher, session_id) = router_fixture(&dir, policy).await;
        store
            .save(&[Task::new("t1", "write the codec")])
            .await
            .expect("seed");

        let event = task_update_event(
            &session_id,
            EventScope::delegate("dlg_0"),
            json!([{ "id": "t1", "description": "write the codec", "status": "completed" }]),
        );
        router.handle(&event).await.expect("handled");

        let tasks = store.load().await.expect("load");
        assert_eq!(tasks[0].status, TaskStatus::Pending, "policy must skip it");
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected_without_failing_the_stream() {
        let dir = TempDir::new().expect("tempdir");
        let (router, store, _dispatcher, session_id) =
            router_fixture(&dir, RoutingPolicy::default()).await;
        store
            .save(&[Task::new("t1", "write the codec")])
            .await
            .expect("seed");

        let event = task_update_event(
            &session_id,
            EventScope::TopLevel,
            json!([{ "id": "t99", "description": "smuggled", "status": "completed" }]),
        );
        router.handle(&event).await.expect("must not propagate");

        assert_eq!(store.rejected_count(), 1);
        let tasks = store.load().await.expect("load");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
    }

    #[tokio::test]
    async fn malformed_task_arguments_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let (router, store, _dispatcher, session_id) =
            router_fixture(&dir, RoutingPolicy::default()).await;
        store
            .save(&[Task::new("t1", "write the codec")])
            .await
            .expect("seed");

        let event = task_update_event(
            &session_id,
            EventScope::TopLevel,
            json!("not a task list"),
        );
        router.handle(&event).await.expect("handled");
        assert_eq!(store.rejected_count(), 0);
    }

    #[tokio::test]
    async fn bound_subagent_start_marks_the_task_in_progress() {
        let dir = TempDir::new().expect("tempdir");
        let (router, store, dispatcher, session_id) =
            router_fixture(&dir, RoutingPolicy::default()).await;
        store
            .save(&[Task::new("t1", "write the codec")])
            .await
            .expect("seed");

        let dispatch = dispatcher
            .dispatch(DelegateTask::for_task("t1", "write the codec"))
            .await
            .expect("dispatch");
        let event = AgentEvent {
            session_id: session_id.clone(),
            sequence: 2,
            timestamp: chrono::Utc::now(),
            scope: EventScope::delegate(dispatch.delegate_id()),
            payload: EventPayload::SubagentStart {
                delegate_id: dispatch.delegate_id().to_string(),
                task: Some("write the codec".to_string()),
            },
        };
        router.handle(&event).await.expect("handled");

        let tasks = store.load().await.expect("load");
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
    }
}
