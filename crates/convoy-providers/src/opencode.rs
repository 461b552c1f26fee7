// OpenCode Adapter
// One HTTP server hosts many sessions; a single SSE listener fans events
// out to whichever sessions this adapter owns. Session ids minted by the
// server are used as canonical ids directly. Child sessions (parentID set)
// are routed onto the parent's stream under a delegate scope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use convoy_types::{
    ContextUsage, DelegateStatus, DelegateTask, EventPayload, EventScope, PermissionMode,
    SessionConfig,
};

use crate::normalize::{Emitter, ToolCallTracker};
use crate::{AdapterCapabilities, BackendAdapter, ProviderError, Result};

const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE: Duration = Duration::from_millis(500);

pub struct OpenCodeAdapter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

struct Shared {
    emitter: Arc<Emitter>,
    client: reqwest::Client,
    base_url: String,
    /// Backend session id -> where its events belong.
    routes: RwLock<HashMap<String, Route>>,
    /// Canonical session id -> tool correlation state.
    trackers: Mutex<HashMap<String, ToolCallTracker>>,
    /// Part id -> accumulated text, for suffix deltas.
    parts_text: Mutex<HashMap<String, String>>,
    usage: Mutex<HashMap<String, ContextUsage>>,
    permission_modes: RwLock<HashMap<String, PermissionMode>>,
    turns_open: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone)]
enum Route {
    Parent {
        canonical_id: String,
    },
    Child {
        canonical_id: String,
        delegate_id: String,
        completed: bool,
    },
}

impl OpenCodeAdapter {
    pub fn new(emitter: Arc<Emitter>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            shared: Arc::new(Shared {
                emitter,
                client: reqwest::Client::new(),
                base_url,
                routes: RwLock::new(HashMap::new()),
                trackers: Mutex::new(HashMap::new()),
                parts_text: Mutex::new(HashMap::new()),
                usage: Mutex::new(HashMap::new()),
                permission_modes: RwLock::new(HashMap::new()),
                turns_open: Mutex::new(HashSet::new()),
            }),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl BackendAdapter for OpenCodeAdapter {
    fn id(&self) -> &'static str {
        "opencode"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_structural_delegation: true,
            supports_resume: true,
        }
    }

    async fn start(&self) -> Result<()> {
        let url = format!("{}/app", self.shared.base_url);
        self.shared
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("opencode unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| ProviderError::Transport(format!("opencode health check failed: {}", e)))?;

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            run_listener(shared, cancel).await;
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn create_session(&self, config: SessionConfig) -> Result<String> {
        let url = format!("{}/session", self.shared.base_url);
        let response = self
            .shared
            .client
            .post(&url)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("session create failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ProviderError::Transport(format!("session create rejected: {}", e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("session create body: {}", e)))?;
        let session_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Protocol("session create returned no id".to_string()))?
            .to_string();

        self.shared.register_parent(&session_id, config.permission_mode).await;
        self.shared
            .emitter
            .emit(
                &session_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "opencode".to_string(),
                    resumed: false,
                },
            )
            .await;
        Ok(session_id)
    }

    async fn resume_session(&self, session_id: &str, config: SessionConfig) -> Result<String> {
        if self.shared.routes.read().await.contains_key(session_id) {
            return Ok(session_id.to_string());
        }
        let url = format!("{}/session/{}", self.shared.base_url, session_id);
        let response = self
            .shared
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("session lookup failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ProviderError::UnknownSession(session_id.to_string()));
        }

        self.shared.register_parent(session_id, config.permission_mode).await;
        self.shared
            .emitter
            .emit(
                session_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "opencode".to_string(),
                    resumed: true,
                },
            )
            .await;
        Ok(session_id.to_string())
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        if !self.shared.routes.read().await.contains_key(session_id) {
            return Err(ProviderError::UnknownSession(session_id.to_string()));
        }
        self.shared
            .turns_open
            .lock()
            .await
            .insert(session_id.to_string());

        // The message endpoint blocks until the turn finishes; content comes
        // over SSE in the meantime, so the request runs detached.
        let shared = self.shared.clone();
        let session_id = session_id.to_string();
        let body = json!({ "parts": [{ "type": "text", "text": prompt }] });
        tokio::spawn(async move {
            let url = format!("{}/session/{}/message", shared.base_url, session_id);
            let result = shared.client.post(&url).json(&body).send().await;
            let failure = match result {
                Ok(response) => response
                    .error_for_status()
                    .err()
                    .map(|e| format!("prompt rejected: {}", e)),
                Err(error) => Some(format!("prompt delivery failed: {}", error)),
            };
            if let Some(message) = failure {
                if shared.turns_open.lock().await.remove(&session_id) {
                    shared
                        .emitter
                        .emit(
                            &session_id,
                            EventScope::TopLevel,
                            EventPayload::SessionError { message },
                        )
                        .await;
                }
            }
        });
        Ok(())
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/session/{}/abort", self.shared.base_url, session_id);
        self.shared
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("abort failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ProviderError::Transport(format!("abort rejected: {}", e)))?;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let mut routes = self.shared.routes.write().await;
        let backend_ids: Vec<String> = routes
            .iter()
            .filter(|(_, route)| route.canonical_id() == session_id)
            .map(|(backend_id, _)| backend_id.clone())
            .collect();
        for backend_id in &backend_ids {
            routes.remove(backend_id);
        }
        drop(routes);

        if let Some(mut tracker) = self.shared.trackers.lock().await.remove(session_id) {
            for (scope, payload) in tracker.resolve_open("session closed") {
                self.shared.emitter.emit(session_id, scope, payload).await;
            }
        }
        self.shared.turns_open.lock().await.remove(session_id);
        self.shared.usage.lock().await.remove(session_id);
        self.shared.permission_modes.write().await.remove(session_id);
        self.shared.emitter.forget_session(session_id).await;

        let url = format!("{}/session/{}", self.shared.base_url, session_id);
        let _ = self.shared.client.delete(&url).send().await;
        Ok(())
    }

    async fn spawn_delegate(&self, session_id: &str, task: DelegateTask) -> Result<String> {
        if !self.shared.routes.read().await.contains_key(session_id) {
            return Err(ProviderError::UnknownSession(session_id.to_string()));
        }
        let url = format!("{}/session", self.shared.base_url);
        let response = self
            .shared
            .client
            .post(&url)
            .json(&json!({ "parentID": session_id }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("delegate create failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ProviderError::Transport(format!("delegate create rejected: {}", e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("delegate create body: {}", e)))?;
        let child_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Protocol("delegate create returned no id".to_string()))?
            .to_string();

        // The listener may have adopted the child from session.updated
        // already; registration is idempotent either way.
        let delegate_id = self
            .shared
            .register_child(&child_id, session_id, Some(task.description.clone()))
            .await;

        let message_url = format!("{}/session/{}/message", self.shared.base_url, child_id);
        let body = json!({ "parts": [{ "type": "text", "text": task.description }] });
        let shared = self.shared.clone();
        let parent = session_id.to_string();
        let failed_delegate = delegate_id.clone();
        tokio::spawn(async move {
            let result = shared.client.post(&message_url).json(&body).send().await;
            let failure = match result {
                Ok(response) => response
                    .error_for_status()
                    .err()
                    .map(|e| format!("delegate prompt rejected: {}", e)),
                Err(error) => Some(format!("delegate prompt failed: {}", error)),
            };
            if let Some(message) = failure {
                shared
                    .emitter
                    .emit(
                        &parent,
                        EventScope::delegate(&failed_delegate),
                        EventPayload::SubagentComplete {
                            delegate_id: failed_delegate.clone(),
                            status: DelegateStatus::Error,
                            summary: Some(message),
                        },
                    )
                    .await;
            }
        });
        Ok(delegate_id)
    }

    async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>> {
        Ok(self.shared.usage.lock().await.get(session_id).copied())
    }
}

impl Route {
    fn canonical_id(&self) -> &str {
        match self {
            Route::Parent { canonical_id } => canonical_id,
            Route::Child { canonical_id, .. } => canonical_id,
        }
    }
}

impl Shared {
    async fn register_parent(&self, session_id: &str, mode: PermissionMode) {
        self.routes.write().await.insert(
            session_id.to_string(),
            Route::Parent {
                canonical_id: session_id.to_string(),
            },
        );
        self.trackers
            .lock()
            .await
            .insert(session_id.to_string(), ToolCallTracker::new());
        self.permission_modes
            .write()
            .await
            .insert(session_id.to_string(), mode);
    }

    /// Route a child session onto its parent's stream. Emits subagent.start
    /// only on first registration so the spawn path and the listener path
    /// cannot double-announce.
    async fn register_child(
        &self,
        child_id: &str,
        parent_canonical: &str,
        task: Option<String>,
    ) -> String {
        let delegate_id = format!("dlg_{}", child_id);
        {
            let mut routes = self.routes.write().await;
            if routes.contains_key(child_id) {
                return delegate_id;
            }
            routes.insert(
                child_id.to_string(),
                Route::Child {
                    canonical_id: parent_canonical.to_string(),
                    delegate_id: delegate_id.clone(),
                    completed: false,
                },
            );
        }
        self.emitter
            .emit(
                parent_canonical,
                EventScope::delegate(&delegate_id),
                EventPayload::SubagentStart {
                    delegate_id: delegate_id.clone(),
                    task,
                },
            )
            .await;
        delegate_id
    }

    async fn route(&self, backend_id: &str) -> Option<Route> {
        self.routes.read().await.get(backend_id).cloned()
    }

    async fn handle_event(&self, value: Value) {
        let Some(event_type) = value.get("type").and_then(|v| v.as_str()) else {
            self.emitter
                .record_mismatch("opencode", "event without type field");
            return;
        };
        let properties = value.get("properties").cloned().unwrap_or(Value::Null);
        match event_type {
            "session.updated" => self.handle_session_updated(&properties).await,
            "session.idle" => self.handle_session_idle(&properties).await,
            "session.error" => self.handle_session_error(&properties).await,
            "session.deleted" => self.handle_session_deleted(&properties).await,
            "message.part.updated" => self.handle_part_updated(&properties).await,
            "permission.updated" => self.handle_permission(&properties).await,
            other => {
                tracing::debug!(backend = "opencode", event = other, "ignoring event type");
            }
        }
    }

    async fn handle_session_updated(&self, properties: &Value) {
        let Some(info) = properties.get("info") else {
            return;
        };
        let Some(backend_id) = info.get("id").and_then(|v| v.as_str()) else {
            self.emitter
                .record_mismatch("opencode", "session.updated without id");
            return;
        };
        if self.route(backend_id).await.is_some() {
            return;
        }
        // A new child of one of our sessions gets adopted; anything else on
        // the shared server is someone else's and stays ignored.
        let Some(parent_backend) = info.get("parentID").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(parent_route) = self.route(parent_backend).await else {
            return;
        };
        let parent_canonical = parent_route.canonical_id().to_string();
        let task = info
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        self.register_child(backend_id, &parent_canonical, task)
            .await;
    }

    async fn handle_session_idle(&self, properties: &Value) {
        let Some(backend_id) = properties.get("sessionID").and_then(|v| v.as_str()) else {
            self.emitter
                .record_mismatch("opencode", "session.idle without sessionID");
            return;
        };
        let mut routes = self.routes.write().await;
        match routes.get_mut(backend_id) {
            Some(Route::Parent { canonical_id }) => {
                let canonical_id = canonical_id.clone();
                drop(routes);
                self.turns_open.lock().await.remove(&canonical_id);
                self.emitter
                    .emit(&canonical_id, EventScope::TopLevel, EventPayload::SessionIdle {})
                    .await;
            }
            Some(Route::Child {
                canonical_id,
                delegate_id,
                completed,
            }) => {
                // A child going idle finishes the delegate; the parent's turn
                // is still running.
                if *completed {
                    return;
                }
                *completed = true;
                let (canonical_id, delegate_id) = (canonical_id.clone(), delegate_id.clone());
                drop(routes);
                self.emitter
                    .emit(
                        &canonical_id,
                        EventScope::delegate(&delegate_id),
                        EventPayload::SubagentComplete {
                            delegate_id: delegate_id.clone(),
                            status: DelegateStatus::Completed,
                            summary: None,
                        },
                    )
                    .await;
            }
            None => {}
        }
    }

    async fn handle_session_error(&self, properties: &Value) {
        let Some(backend_id) = properties.get("sessionID").and_then(|v| v.as_str()) else {
            tracing::debug!(backend = "opencode", "server-level error event");
            return;
        };
        let message = properties
            .pointer("/error/data/message")
            .or_else(|| properties.pointer("/error/message"))
            .and_then(|v| v.as_str())
            .unwrap_or("backend reported an error")
            .to_string();
        let mut routes = self.routes.write().await;
        match routes.get_mut(backend_id) {
            Some(Route::Parent { canonical_id }) => {
                let canonical_id = canonical_id.clone();
                drop(routes);
                self.turns_open.lock().await.remove(&canonical_id);
                self.emitter
                    .emit(
                        &canonical_id,
                        EventScope::TopLevel,
                        EventPayload::SessionError { message },
                    )
                    .await;
            }
            Some(Route::Child {
                canonical_id,
                delegate_id,
                completed,
            }) => {
                if *completed {
                    return;
                }
                *completed = true;
                let (canonical_id, delegate_id) = (canonical_id.clone(), delegate_id.clone());
                drop(routes);
                self.emitter
                    .emit(
                        &canonical_id,
                        EventScope::delegate(&delegate_id),
                        EventPayload::SubagentComplete {
                            delegate_id: delegate_id.clone(),
                            status: DelegateStatus::Error,
                            summary: Some(message),
                        },
                    )
                    .await;
            }
            None => {}
        }
    }

    async fn handle_session_deleted(&self, properties: &Value) {
        let Some(backend_id) = properties.pointer("/info/id").and_then(|v| v.as_str()) else {
            return;
        };
        self.routes.write().await.remove(backend_id);
    }

    async fn handle_part_updated(&self, properties: &Value) {
        let Some(part) = properties.get("part") else {
            self.emitter
                .record_mismatch("opencode", "part update without part");
            return;
        };
        let Some(backend_id) = part.get("sessionID").and_then(|v| v.as_str()) else {
            self.emitter
                .record_mismatch("opencode", "part update without sessionID");
            return;
        };
        let Some(route) = self.route(backend_id).await else {
            return;
        };
        let canonical_id = route.canonical_id().to_string();
        let scope = match &route {
            Route::Parent { .. } => EventScope::TopLevel,
            Route::Child { delegate_id, .. } => EventScope::delegate(delegate_id),
        };
        let part_type = part.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match part_type {
            "text" => self.handle_text_part(&canonical_id, scope, part).await,
            "tool" => self.handle_tool_part(&canonical_id, scope, part).await,
            "step-finish" => {
                // Token accounting rides on the parent stream only.
                if matches!(route, Route::Parent { .. }) {
                    self.handle_step_finish(&canonical_id, part).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_text_part(&self, canonical_id: &str, scope: EventScope, part: &Value) {
        let Some(part_id) = part.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(text) = part.get("text").and_then(|v| v.as_str()) else {
            return;
        };
        let message_id = part
            .get("messageID")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        // Parts arrive as full snapshots; emit only what grew.
        let delta = {
            let mut parts = self.parts_text.lock().await;
            let seen = parts.entry(part_id.to_string()).or_default();
            let delta = match text.strip_prefix(seen.as_str()) {
                Some(suffix) => suffix.to_string(),
                None => text.to_string(),
            };
            *seen = text.to_string();
            delta
        };
        if delta.is_empty() {
            return;
        }
        self.emitter
            .emit(
                canonical_id,
                scope,
                EventPayload::MessageDelta {
                    message_id,
                    text: delta,
                },
            )
            .await;
    }

    async fn handle_tool_part(&self, canonical_id: &str, scope: EventScope, part: &Value) {
        let call_id = part
            .get("callID")
            .or_else(|| part.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if call_id.is_empty() {
            self.emitter
                .record_mismatch("opencode", "tool part without call id");
            return;
        }
        let name = part.get("tool").and_then(|v| v.as_str()).map(|s| s.to_string());
        let Some(state) = part.get("state") else {
            return;
        };
        let status = state.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let mut trackers = self.trackers.lock().await;
        let tracker = trackers
            .entry(canonical_id.to_string())
            .or_insert_with(ToolCallTracker::new);
        let events = match status {
            // Repeated running snapshots are routine; only the first opens
            // the call.
            "running" => tracker
                .begin(
                    &call_id,
                    name.as_deref().unwrap_or("unknown"),
                    state.get("input").cloned().unwrap_or(Value::Null),
                    scope,
                )
                .into_iter()
                .collect(),
            "completed" => tracker.complete(
                &call_id,
                name.as_deref(),
                state.get("output").cloned(),
                None,
                scope,
            ),
            "error" | "failed" | "cancelled" | "denied" | "aborted" | "timeout" => {
                let error = state
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("tool {}", status));
                tracker.complete(&call_id, name.as_deref(), None, Some(error), scope)
            }
            "pending" => Vec::new(),
            other => {
                self.emitter
                    .record_mismatch("opencode", &format!("unknown tool status: {}", other));
                Vec::new()
            }
        };
        drop(trackers);
        for (scope, payload) in events {
            self.emitter.emit(canonical_id, scope, payload).await;
        }
    }

    async fn handle_step_finish(&self, canonical_id: &str, part: &Value) {
        let input = part
            .pointer("/tokens/input")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output = part
            .pointer("/tokens/output")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if input == 0 && output == 0 {
            return;
        }
        let usage = ContextUsage {
            input_tokens: input,
            output_tokens: output,
            context_window: None,
        };
        self.usage
            .lock()
            .await
            .insert(canonical_id.to_string(), usage);
        self.emitter
            .emit(canonical_id, EventScope::TopLevel, EventPayload::Usage { usage })
            .await;
    }

    async fn handle_permission(&self, properties: &Value) {
        let Some(backend_id) = properties.get("sessionID").and_then(|v| v.as_str()) else {
            self.emitter
                .record_mismatch("opencode", "permission without sessionID");
            return;
        };
        let Some(route) = self.route(backend_id).await else {
            return;
        };
        let canonical_id = route.canonical_id().to_string();
        let request_id = properties
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if request_id.is_empty() {
            self.emitter
                .record_mismatch("opencode", "permission without id");
            return;
        }
        let tool = properties
            .get("title")
            .or_else(|| properties.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let arguments = properties.get("metadata").cloned().unwrap_or(Value::Null);
        self.emitter
            .emit(
                &canonical_id,
                EventScope::TopLevel,
                EventPayload::PermissionRequested {
                    request_id: request_id.clone(),
                    tool,
                    arguments,
                },
            )
            .await;

        let mode = self
            .permission_modes
            .read()
            .await
            .get(&canonical_id)
            .copied()
            .unwrap_or_default();
        let reply = match mode {
            PermissionMode::AutoApprove => "always",
            PermissionMode::Deny => "reject",
        };
        let url = format!(
            "{}/session/{}/permissions/{}",
            self.base_url, backend_id, request_id
        );
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&json!({ "response": reply }))
                .send()
                .await;
            if let Err(error) = result {
                tracing::warn!(backend = "opencode", error = %error, "permission reply failed");
            }
        });
    }

    /// The event stream is gone for good; any session mid-turn would hang
    /// forever waiting for idle, so fail them explicitly.
    async fn fail_open_turns(&self, reason: &str) {
        let open: Vec<String> = self.turns_open.lock().await.drain().collect();
        for session_id in open {
            self.emitter
                .emit(
                    &session_id,
                    EventScope::TopLevel,
                    EventPayload::SessionError {
                        message: reason.to_string(),
                    },
                )
                .await;
        }
    }
}

async fn run_listener(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let url = format!("{}/event", shared.base_url);
        match shared.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                attempt = 0;
                let mut stream = response.bytes_stream();
                let mut parser = SseParser::new();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                let text = String::from_utf8_lossy(&bytes);
                                for payload in parser.feed(&text) {
                                    match serde_json::from_str::<Value>(&payload) {
                                        Ok(value) => shared.handle_event(value).await,
                                        Err(error) => shared.emitter.record_mismatch(
                                            "opencode",
                                            &format!("unparseable event payload: {}", error),
                                        ),
                                    }
                                }
                            }
                            Some(Err(error)) => {
                                tracing::warn!(backend = "opencode", error = %error, "event stream broke");
                                break;
                            }
                            None => {
                                tracing::warn!(backend = "opencode", "event stream ended");
                                break;
                            }
                        },
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(backend = "opencode", status = %response.status(), "event stream refused");
            }
            Err(error) => {
                tracing::warn!(backend = "opencode", error = %error, "event stream connect failed");
            }
        }
        attempt += 1;
        if attempt > RECONNECT_ATTEMPTS {
            shared.fail_open_turns("event stream lost").await;
            return;
        }
        tokio::time::sleep(RECONNECT_BASE * attempt).await;
    }
}

/// Incremental `text/event-stream` splitter. Frames end on a blank line;
/// only `data:` lines matter, joined with newlines when a frame has several.
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                }
            }
            if !data.is_empty() && data != "[DONE]" {
                payloads.push(data);
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::{AgentEvent, EventKind};
    use tokio::sync::broadcast;

    fn shared_fixture() -> (Arc<Shared>, broadcast::Receiver<AgentEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let adapter = OpenCodeAdapter::new(Arc::new(Emitter::new(tx)), "http://127.0.0.1:1");
        (adapter.shared, rx)
    }

    async fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn sse_parser_splits_frames_across_chunks() {
        let mut parser = SseParser::new();
        let first = parser.feed("data: {\"a\":1}\n\ndata: {\"b\"");
        assert_eq!(first, vec!["{\"a\":1}".to_string()]);
        let second = parser.feed(":2}\n\n");
        assert_eq!(second, vec!["{\"b\":2}".to_string()]);
        assert!(parser.feed(": keepalive\n\n").is_empty());
    }

    #[tokio::test]
    async fn child_idle_completes_delegate_without_ending_parent_turn() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_parent", PermissionMode::AutoApprove).await;
        shared
            .register_child("oc_child", "oc_parent", Some("survey".to_string()))
            .await;
        drain(&mut rx).await;

        shared
            .handle_event(json!({
                "type": "session.idle",
                "properties": { "sessionID": "oc_child" },
            }))
            .await;
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::SubagentComplete);
        assert!(!events[0].ends_turn());

        shared
            .handle_event(json!({
                "type": "session.idle",
                "properties": { "sessionID": "oc_parent" },
            }))
            .await;
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::SessionIdle);
    }

    #[tokio::test]
    async fn repeated_running_snapshots_open_the_call_once() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_s", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        let running = json!({
            "type": "message.part.updated",
            "properties": { "part": {
                "id": "prt_1", "sessionID": "oc_s", "messageID": "msg_1",
                "type": "tool", "callID": "call_1", "tool": "bash",
                "state": { "status": "running", "input": { "command": "ls" } },
            }},
        });
        shared.handle_event(running.clone()).await;
        shared.handle_event(running).await;
        shared
            .handle_event(json!({
                "type": "message.part.updated",
                "properties": { "part": {
                    "id": "prt_1", "sessionID": "oc_s", "messageID": "msg_1",
                    "type": "tool", "callID": "call_1", "tool": "bash",
                    "state": { "status": "completed", "output": "ok" },
                }},
            }))
            .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::ToolStart);
        assert_eq!(events[1].kind(), EventKind::ToolComplete);
        // Snapshot replays are routine, not protocol violations.
        assert_eq!(shared.emitter.mismatch_count(), 0);
    }

    #[tokio::test]
    async fn failed_tool_status_carries_error() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_s", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        shared
            .handle_event(json!({
                "type": "message.part.updated",
                "properties": { "part": {
                    "id": "prt_2", "sessionID": "oc_s", "type": "tool",
                    "callID": "call_2", "tool": "webfetch",
                    "state": { "status": "running", "input": {} },
                }},
            }))
            .await;
        shared
            .handle_event(json!({
                "type": "message.part.updated",
                "properties": { "part": {
                    "id": "prt_2", "sessionID": "oc_s", "type": "tool",
                    "callID": "call_2", "tool": "webfetch",
                    "state": { "status": "error", "error": "connection refused" },
                }},
            }))
            .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        match &events[1].payload {
            EventPayload::ToolComplete { error, .. } => {
                assert_eq!(error.as_deref(), Some("connection refused"));
            }
            other => panic!("expected tool.complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn text_snapshots_become_suffix_deltas() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_s", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        for text in ["Hel", "Hello, wor", "Hello, world"] {
            shared
                .handle_event(json!({
                    "type": "message.part.updated",
                    "properties": { "part": {
                        "id": "prt_t", "sessionID": "oc_s", "messageID": "msg_2",
                        "type": "text", "text": text,
                    }},
                }))
                .await;
        }

        let events = drain(&mut rx).await;
        let deltas: Vec<String> = events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::MessageDelta { text, .. } => text.clone(),
                other => panic!("expected message.delta, got {:?}", other),
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo, wor", "ld"]);
    }

    #[tokio::test]
    async fn foreign_session_events_are_ignored() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_mine", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        shared
            .handle_event(json!({
                "type": "session.idle",
                "properties": { "sessionID": "oc_theirs" },
            }))
            .await;
        shared
            .handle_event(json!({
                "type": "session.updated",
                "properties": { "info": { "id": "oc_other", "title": "stray" } },
            }))
            .await;

        assert!(drain(&mut rx).await.is_empty());
        assert_eq!(shared.emitter.mismatch_count(), 0);
    }

    #[tokio::test]
    async fn child_announced_by_listener_is_adopted_once() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_parent", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        let updated = json!({
            "type": "session.updated",
            "properties": { "info": {
                "id": "oc_kid", "parentID": "oc_parent", "title": "dig into the parser",
            }},
        });
        shared.handle_event(updated.clone()).await;
        shared.handle_event(updated).await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::SubagentStart);
        assert_eq!(events[0].scope, EventScope::delegate("dlg_oc_kid"));
    }

    #[tokio::test]
    async fn step_finish_records_usage() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_s", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        shared
            .handle_event(json!({
                "type": "message.part.updated",
                "properties": { "part": {
                    "id": "prt_f", "sessionID": "oc_s", "type": "step-finish",
                    "tokens": { "input": 900, "output": 120 },
                }},
            }))
            .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Usage);
        assert_eq!(
            shared.usage.lock().await.get("oc_s").map(|u| u.total()),
            Some(1020)
        );
    }

    #[tokio::test]
    async fn permission_event_surfaces_request() {
        let (shared, mut rx) = shared_fixture();
        shared.register_parent("oc_s", PermissionMode::AutoApprove).await;
        drain(&mut rx).await;

        shared
            .handle_event(json!({
                "type": "permission.updated",
                "properties": {
                    "id": "perm_1", "sessionID": "oc_s",
                    "title": "bash", "metadata": { "command": "rm -rf target" },
                },
            }))
            .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::PermissionRequested { request_id, tool, .. } => {
                assert_eq!(request_id, "perm_1");
                assert_eq!(tool, "bash");
            }
            other => panic!("expected permission.requested, got {:?}", other),
        }
    }
}
