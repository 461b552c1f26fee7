// Claude Code Adapter
// One CLI subprocess per session speaking JSONL on stdio (stream-json in
// both directions). Control traffic (interrupts, permission callbacks)
// shares the pipe with content, so a single writer task owns stdin and a
// single reader task owns stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use convoy_types::{
    ContextUsage, DelegateStatus, DelegateTask, EventPayload, EventScope, PermissionMode,
    SessionConfig,
};

use crate::normalize::{Emitter, ToolCallTracker};
use crate::{AdapterCapabilities, BackendAdapter, ProviderError, Result};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ClaudeAdapter {
    emitter: Arc<Emitter>,
    binary: String,
    sessions: RwLock<HashMap<String, Arc<ClaudeSession>>>,
}

struct ClaudeSession {
    writer: mpsc::UnboundedSender<String>,
    child: Mutex<Child>,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    /// Delegate processes spawned for this session, by delegate id.
    delegate_children: Mutex<HashMap<String, Child>>,
}

/// State the reader task shares with the adapter surface.
struct SessionShared {
    permission_mode: PermissionMode,
    turn_open: AtomicBool,
    tracker: Mutex<ToolCallTracker>,
    /// Task tool_use id -> delegate id, for scoping nested events.
    task_delegates: Mutex<HashMap<String, String>>,
    usage: Mutex<Option<ContextUsage>>,
}

impl SessionShared {
    fn new(permission_mode: PermissionMode) -> Self {
        Self {
            permission_mode,
            turn_open: AtomicBool::new(false),
            tracker: Mutex::new(ToolCallTracker::new()),
            task_delegates: Mutex::new(HashMap::new()),
            usage: Mutex::new(None),
        }
    }
}

impl ClaudeAdapter {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self::with_binary(emitter, "claude")
    }

    pub fn with_binary(emitter: Arc<Emitter>, binary: impl Into<String>) -> Self {
        Self {
            emitter,
            binary: binary.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn session(&self, session_id: &str) -> Result<Arc<ClaudeSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownSession(session_id.to_string()))
    }

    async fn launch(&self, config: SessionConfig, resume_id: Option<&str>) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(model) = &config.model {
            command.arg("--model").arg(model);
        }
        if let Some(system_prompt) = &config.system_prompt {
            command.arg("--append-system-prompt").arg(system_prompt);
        }
        for server in &config.tool_servers {
            command.arg("--mcp-config").arg(server);
        }
        if let Some(resume_id) = resume_id {
            command.arg("--resume").arg(resume_id);
        }
        if let Some(workspace) = &config.workspace {
            command.current_dir(workspace);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| ProviderError::Transport(format!("failed to spawn claude: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Transport("claude stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Transport("claude stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = "claude", line = %line, "backend stderr");
                }
            });
        }

        let writer = spawn_writer(stdin);
        let shared = Arc::new(SessionShared::new(config.permission_mode));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut pump = MessagePump {
            emitter: self.emitter.clone(),
            session_id: resume_id.map(|id| id.to_string()),
            ready: Some(ready_tx),
            writer: writer.clone(),
            shared: shared.clone(),
        };
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => pump.handle_line(&line).await,
                        Ok(None) => {
                            pump.handle_stream_closed("backend process exited").await;
                            return;
                        }
                        Err(error) => {
                            pump.handle_stream_closed(&format!("backend read failed: {}", error))
                                .await;
                            return;
                        }
                    },
                }
            }
        });

        // The CLI reports its session id in the init message; that id is
        // the canonical one so resume works from a bare checkpoint.
        let session_id = match tokio::time::timeout(INIT_TIMEOUT, ready_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) | Err(_) => {
                cancel.cancel();
                let _ = child.kill().await;
                return Err(ProviderError::Transport(
                    "timed out waiting for claude session init".to_string(),
                ));
            }
        };
        if let Some(requested) = resume_id {
            if requested != session_id {
                tracing::warn!(
                    requested,
                    reported = %session_id,
                    "claude resumed under a different backend id"
                );
            }
        }
        let canonical_id = resume_id.unwrap_or(&session_id).to_string();

        let session = Arc::new(ClaudeSession {
            writer,
            child: Mutex::new(child),
            config,
            shared,
            cancel,
            delegate_children: Mutex::new(HashMap::new()),
        });
        self.sessions
            .write()
            .await
            .insert(canonical_id.clone(), session);

        self.emitter
            .emit(
                &canonical_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "claude".to_string(),
                    resumed: resume_id.is_some(),
                },
            )
            .await;
        Ok(canonical_id)
    }
}

#[async_trait]
impl BackendAdapter for ClaudeAdapter {
    fn id(&self) -> &'static str {
        "claude"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_structural_delegation: true,
            supports_resume: true,
        }
    }

    async fn create_session(&self, config: SessionConfig) -> Result<String> {
        self.launch(config, None).await
    }

    async fn resume_session(&self, session_id: &str, config: SessionConfig) -> Result<String> {
        if self.sessions.read().await.contains_key(session_id) {
            return Ok(session_id.to_string());
        }
        self.launch(config, Some(session_id)).await
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        let message = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        session.shared.turn_open.store(true, Ordering::SeqCst);
        session
            .writer
            .send(message.to_string())
            .map_err(|_| ProviderError::Transport("claude stdin writer closed".to_string()))
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        let session = self.session(session_id).await?;

        // In-flight delegate processes are cut down with the turn.
        let mut children = session.delegate_children.lock().await;
        for (delegate_id, mut child) in children.drain() {
            let _ = child.start_kill();
            self.emitter
                .emit(
                    session_id,
                    EventScope::delegate(&delegate_id),
                    EventPayload::SubagentComplete {
                        delegate_id: delegate_id.clone(),
                        status: DelegateStatus::Interrupted,
                        summary: None,
                    },
                )
                .await;
        }
        drop(children);

        let control = json!({ "type": "control", "method": "interrupt" });
        session
            .writer
            .send(control.to_string())
            .map_err(|_| ProviderError::Transport("claude stdin writer closed".to_string()))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return Ok(());
        };
        session.cancel.cancel();
        let mut children = session.delegate_children.lock().await;
        for (_, mut child) in children.drain() {
            let _ = child.start_kill();
        }
        drop(children);
        let _ = session.child.lock().await.kill().await;

        let orphans = session
            .shared
            .tracker
            .lock()
            .await
            .resolve_open("session closed");
        for (scope, payload) in orphans {
            self.emitter.emit(session_id, scope, payload).await;
        }
        self.emitter.forget_session(session_id).await;
        Ok(())
    }

    async fn spawn_delegate(&self, session_id: &str, task: DelegateTask) -> Result<String> {
        let session = self.session(session_id).await?;
        let delegate_id = format!("dlg_{}", Uuid::new_v4().simple());

        let mut command = Command::new(&self.binary);
        command
            .arg("-p")
            .arg(&task.description)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions");
        if let Some(model) = &session.config.model {
            command.arg("--model").arg(model);
        }
        if let Some(workspace) = &session.config.workspace {
            command.current_dir(workspace);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| {
            ProviderError::Transport(format!("failed to spawn claude delegate: {}", e))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::Transport("claude delegate stdout unavailable".to_string())
        })?;

        self.emitter
            .emit(
                session_id,
                EventScope::delegate(&delegate_id),
                EventPayload::SubagentStart {
                    delegate_id: delegate_id.clone(),
                    task: Some(task.description.clone()),
                },
            )
            .await;

        let mut pump = DelegatePump {
            emitter: self.emitter.clone(),
            session_id: session_id.to_string(),
            delegate_id: delegate_id.clone(),
            tracker: ToolCallTracker::new(),
            finished: false,
        };
        let cancel = session.cancel.child_token();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => pump.handle_line(&line).await,
                        Ok(None) => {
                            pump.handle_eof().await;
                            return;
                        }
                        Err(error) => {
                            pump.handle_failure(&format!("delegate read failed: {}", error)).await;
                            return;
                        }
                    },
                }
            }
        });

        session
            .delegate_children
            .lock()
            .await
            .insert(delegate_id.clone(), child);
        Ok(delegate_id)
    }

    async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>> {
        let session = self.session(session_id).await?;
        let usage = *session.shared.usage.lock().await;
        Ok(usage)
    }
}

fn spawn_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.write_all(b"\n").await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawClaudeMessage {
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: RawAssistantMessage,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    User {
        #[serde(default)]
        message: Value,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<RawUsage>,
    },
    ControlRequest {
        request_id: String,
        request: Value,
    },
    ControlResponse {
        #[serde(default)]
        response: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawAssistantMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<RawContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Flatten a tool_result content value (string or block list) to text.
fn tool_result_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            (!out.is_empty()).then_some(out)
        }
        _ => None,
    }
}

// ============================================================================
// Reader-side translation
// ============================================================================

/// Owns the stdout side of one session: parses each JSONL line and emits
/// canonical events. Runs inside the reader task; only `shared` is visible
/// to the adapter surface.
struct MessagePump {
    emitter: Arc<Emitter>,
    session_id: Option<String>,
    ready: Option<oneshot::Sender<String>>,
    writer: mpsc::UnboundedSender<String>,
    shared: Arc<SessionShared>,
}

impl MessagePump {
    async fn handle_line(&mut self, line: &str) {
        let message: RawClaudeMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                self.emitter
                    .record_mismatch("claude", &format!("unparseable line: {}", error));
                return;
            }
        };
        self.handle_message(message).await;
    }

    async fn handle_message(&mut self, message: RawClaudeMessage) {
        match message {
            RawClaudeMessage::System {
                subtype,
                session_id,
            } => {
                if subtype == "init" {
                    if let Some(id) = session_id {
                        if self.session_id.is_none() {
                            self.session_id = Some(id.clone());
                        }
                        if let Some(ready) = self.ready.take() {
                            let _ = ready.send(id);
                        }
                    }
                }
            }
            RawClaudeMessage::Assistant {
                message,
                parent_tool_use_id,
            } => {
                let scope = self.resolve_scope(parent_tool_use_id.as_deref()).await;
                self.handle_assistant(message, scope).await;
            }
            RawClaudeMessage::User {
                message,
                parent_tool_use_id,
            } => {
                let scope = self.resolve_scope(parent_tool_use_id.as_deref()).await;
                self.handle_tool_results(&message, scope).await;
            }
            RawClaudeMessage::Result {
                is_error,
                result,
                usage,
            } => {
                self.handle_result(is_error, result, usage).await;
            }
            RawClaudeMessage::ControlRequest {
                request_id,
                request,
            } => {
                self.handle_control_request(&request_id, &request).await;
            }
            RawClaudeMessage::ControlResponse { .. } => {}
            RawClaudeMessage::Unknown => {
                tracing::debug!(backend = "claude", "ignoring unmapped message type");
            }
        }
    }

    async fn handle_assistant(&mut self, message: RawAssistantMessage, scope: EventScope) {
        let Some(session_id) = self.session_id.clone() else {
            tracing::debug!(backend = "claude", "dropping event before session init");
            return;
        };
        for block in message.content {
            match block {
                RawContentBlock::Text { text } => {
                    self.emitter
                        .emit(
                            &session_id,
                            scope.clone(),
                            EventPayload::MessageComplete {
                                message_id: message.id.clone(),
                                text,
                            },
                        )
                        .await;
                }
                RawContentBlock::ToolUse { id, name, input } => {
                    if name == "Task" {
                        self.begin_task_delegate(&session_id, &id, &input).await;
                        continue;
                    }
                    let started = self
                        .shared
                        .tracker
                        .lock()
                        .await
                        .begin(&id, &name, input, scope.clone());
                    match started {
                        Some((scope, payload)) => {
                            self.emitter.emit(&session_id, scope, payload).await;
                        }
                        None => {
                            self.emitter.record_mismatch(
                                "claude",
                                &format!("duplicate tool_use id {}", id),
                            );
                        }
                    }
                }
                RawContentBlock::ToolResult { .. } => {
                    // Results always arrive on user messages.
                    self.emitter
                        .record_mismatch("claude", "tool_result inside assistant message");
                }
                RawContentBlock::Unknown => {}
            }
        }
    }

    async fn handle_tool_results(&mut self, message: &Value, scope: EventScope) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let Some(blocks) = message.get("content").and_then(|v| v.as_array()) else {
            // Plain-text user echoes carry nothing to normalize.
            return;
        };
        for block in blocks {
            let Ok(parsed) = serde_json::from_value::<RawContentBlock>(block.clone()) else {
                self.emitter
                    .record_mismatch("claude", "unparseable user content block");
                continue;
            };
            if let RawContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = parsed
            {
                if let Some(delegate_id) = self
                    .shared
                    .task_delegates
                    .lock()
                    .await
                    .remove(&tool_use_id)
                {
                    let status = if is_error {
                        DelegateStatus::Error
                    } else {
                        DelegateStatus::Completed
                    };
                    self.emitter
                        .emit(
                            &session_id,
                            EventScope::delegate(&delegate_id),
                            EventPayload::SubagentComplete {
                                delegate_id,
                                status,
                                summary: tool_result_text(&content),
                            },
                        )
                        .await;
                    continue;
                }

                let (output, error) = if is_error {
                    (
                        None,
                        Some(
                            tool_result_text(&content)
                                .unwrap_or_else(|| "tool reported an error".to_string()),
                        ),
                    )
                } else {
                    (Some(content), None)
                };
                let events = self.shared.tracker.lock().await.complete(
                    &tool_use_id,
                    None,
                    output,
                    error,
                    scope.clone(),
                );
                if events.is_empty() {
                    self.emitter.record_mismatch(
                        "claude",
                        &format!("duplicate tool_result for {}", tool_use_id),
                    );
                }
                for (scope, payload) in events {
                    self.emitter.emit(&session_id, scope, payload).await;
                }
            }
        }
    }

    async fn handle_result(
        &mut self,
        is_error: bool,
        result: Option<String>,
        usage: Option<RawUsage>,
    ) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        if let Some(raw) = usage {
            let usage = ContextUsage {
                input_tokens: raw.input_tokens,
                output_tokens: raw.output_tokens,
                context_window: None,
            };
            *self.shared.usage.lock().await = Some(usage);
            self.emitter
                .emit(
                    &session_id,
                    EventScope::TopLevel,
                    EventPayload::Usage { usage },
                )
                .await;
        }
        self.shared.turn_open.store(false, Ordering::SeqCst);
        let payload = if is_error {
            EventPayload::SessionError {
                message: result.unwrap_or_else(|| "turn failed".to_string()),
            }
        } else {
            EventPayload::SessionIdle {}
        };
        self.emitter
            .emit(&session_id, EventScope::TopLevel, payload)
            .await;
    }

    async fn handle_control_request(&mut self, request_id: &str, request: &Value) {
        let subtype = request.get("subtype").and_then(|v| v.as_str());
        match subtype {
            Some("can_use_tool") => {
                let Some(session_id) = self.session_id.clone() else {
                    return;
                };
                let tool = request
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let arguments = request.get("input").cloned().unwrap_or(Value::Null);
                self.emitter
                    .emit(
                        &session_id,
                        EventScope::TopLevel,
                        EventPayload::PermissionRequested {
                            request_id: request_id.to_string(),
                            tool,
                            arguments: arguments.clone(),
                        },
                    )
                    .await;

                let decision = match self.shared.permission_mode {
                    PermissionMode::AutoApprove => json!({
                        "behavior": "allow",
                        "updatedInput": arguments,
                    }),
                    PermissionMode::Deny => json!({
                        "behavior": "deny",
                        "message": "denied by session policy",
                    }),
                };
                let response = json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "success",
                        "request_id": request_id,
                        "response": decision,
                    },
                });
                let _ = self.writer.send(response.to_string());
            }
            Some(other) => {
                self.emitter
                    .record_mismatch("claude", &format!("unhandled control_request: {}", other));
            }
            None => {
                self.emitter
                    .record_mismatch("claude", "control_request without subtype");
            }
        }
    }

    async fn handle_stream_closed(&mut self, reason: &str) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let orphans = self.shared.tracker.lock().await.resolve_open(reason);
        for (scope, payload) in orphans {
            self.emitter.emit(&session_id, scope, payload).await;
        }
        // Only a turn in flight needs an error edge to resolve it.
        if self.shared.turn_open.swap(false, Ordering::SeqCst) {
            self.emitter
                .emit(
                    &session_id,
                    EventScope::TopLevel,
                    EventPayload::SessionError {
                        message: reason.to_string(),
                    },
                )
                .await;
        } else {
            tracing::debug!(backend = "claude", reason, "stream closed between turns");
        }
    }

    /// Map a parent_tool_use_id to a delegate scope. A parent id we never
    /// saw start is adopted on the spot so scoping stays faithful.
    async fn resolve_scope(&mut self, parent_tool_use_id: Option<&str>) -> EventScope {
        let Some(parent_id) = parent_tool_use_id else {
            return EventScope::TopLevel;
        };
        let mut delegates = self.shared.task_delegates.lock().await;
        if let Some(delegate_id) = delegates.get(parent_id) {
            return EventScope::delegate(delegate_id.clone());
        }
        let delegate_id = format!("dlg_{}", parent_id);
        delegates.insert(parent_id.to_string(), delegate_id.clone());
        drop(delegates);

        if let Some(session_id) = self.session_id.clone() {
            self.emitter
                .emit(
                    &session_id,
                    EventScope::delegate(&delegate_id),
                    EventPayload::SubagentStart {
                        delegate_id: delegate_id.clone(),
                        task: None,
                    },
                )
                .await;
        }
        EventScope::delegate(delegate_id)
    }

    async fn begin_task_delegate(&mut self, session_id: &str, tool_use_id: &str, input: &Value) {
        let delegate_id = format!("dlg_{}", tool_use_id);
        self.shared
            .task_delegates
            .lock()
            .await
            .insert(tool_use_id.to_string(), delegate_id.clone());
        let task = input
            .get("description")
            .or_else(|| input.get("prompt"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        self.emitter
            .emit(
                session_id,
                EventScope::delegate(&delegate_id),
                EventPayload::SubagentStart { delegate_id, task },
            )
            .await;
    }
}

/// Translates the one-shot stdout of a delegate process onto the parent
/// session's stream under a delegate scope. The delegate's own init and
/// result lines become subagent lifecycle events, never session ones.
struct DelegatePump {
    emitter: Arc<Emitter>,
    session_id: String,
    delegate_id: String,
    tracker: ToolCallTracker,
    finished: bool,
}

impl DelegatePump {
    async fn handle_line(&mut self, line: &str) {
        let message: RawClaudeMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                self.emitter
                    .record_mismatch("claude", &format!("unparseable delegate line: {}", error));
                return;
            }
        };
        let scope = EventScope::delegate(&self.delegate_id);
        match message {
            RawClaudeMessage::Assistant { message, .. } => {
                for block in message.content {
                    match block {
                        RawContentBlock::Text { text } => {
                            self.emitter
                                .emit(
                                    &self.session_id,
                                    scope.clone(),
                                    EventPayload::MessageComplete {
                                        message_id: message.id.clone(),
                                        text,
                                    },
                                )
                                .await;
                        }
                        RawContentBlock::ToolUse { id, name, input } => {
                            if let Some((scope, payload)) =
                                self.tracker.begin(&id, &name, input, scope.clone())
                            {
                                self.emitter.emit(&self.session_id, scope, payload).await;
                            }
                        }
                        RawContentBlock::ToolResult { .. } | RawContentBlock::Unknown => {}
                    }
                }
            }
            RawClaudeMessage::User { message, .. } => {
                let Some(blocks) = message.get("content").and_then(|v| v.as_array()) else {
                    return;
                };
                for block in blocks {
                    let Ok(RawContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    }) = serde_json::from_value::<RawContentBlock>(block.clone())
                    else {
                        continue;
                    };
                    let (output, error) = if is_error {
                        (None, tool_result_text(&content).or(Some("tool error".to_string())))
                    } else {
                        (Some(content), None)
                    };
                    for (scope, payload) in
                        self.tracker
                            .complete(&tool_use_id, None, output, error, scope.clone())
                    {
                        self.emitter.emit(&self.session_id, scope, payload).await;
                    }
                }
            }
            RawClaudeMessage::Result {
                is_error, result, ..
            } => {
                self.finished = true;
                let status = if is_error {
                    DelegateStatus::Error
                } else {
                    DelegateStatus::Completed
                };
                self.emitter
                    .emit(
                        &self.session_id,
                        scope,
                        EventPayload::SubagentComplete {
                            delegate_id: self.delegate_id.clone(),
                            status,
                            summary: result,
                        },
                    )
                    .await;
            }
            _ => {}
        }
    }

    async fn handle_eof(&mut self) {
        if !self.finished {
            self.handle_failure("delegate process exited unexpectedly")
                .await;
        }
    }

    async fn handle_failure(&mut self, reason: &str) {
        self.finished = true;
        let orphans = self.tracker.resolve_open(reason);
        for (scope, payload) in orphans {
            self.emitter.emit(&self.session_id, scope, payload).await;
        }
        self.emitter
            .emit(
                &self.session_id,
                EventScope::delegate(&self.delegate_id),
                EventPayload::SubagentComplete {
                    delegate_id: self.delegate_id.clone(),
                    status: DelegateStatus::Error,
                    summary: Some(reason.to_string()),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::{AgentEvent, EventKind};
    use tokio::sync::broadcast;

    fn pump_fixture() -> (
        MessagePump,
        broadcast::Receiver<AgentEvent>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = broadcast::channel(256);
        let emitter = Arc::new(Emitter::new(tx));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let pump = MessagePump {
            emitter,
            session_id: Some("ses_test".to_string()),
            ready: None,
            writer: writer_tx,
            shared: Arc::new(SessionShared::new(PermissionMode::AutoApprove)),
        };
        (pump, rx, writer_rx)
    }

    async fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn assistant_text_becomes_message_complete() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.handle_line(
            r#"{"type":"assistant","message":{"id":"msg_1","role":"assistant","content":[{"type":"text","text":"hello"}]},"parent_tool_use_id":null}"#,
        )
        .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::MessageComplete);
        assert_eq!(events[0].scope, EventScope::TopLevel);
    }

    #[tokio::test]
    async fn tool_use_and_result_pair_by_call_id() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        )
        .await;
        pump.handle_line(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"src\ntests","is_error":false}]}}"#,
        )
        .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::ToolStart);
        assert_eq!(events[1].kind(), EventKind::ToolComplete);
        match &events[1].payload {
            EventPayload::ToolComplete {
                call_id,
                name,
                arguments,
                ..
            } => {
                assert_eq!(call_id, "toolu_1");
                // The result edge carried no name; it came from the cache.
                assert_eq!(name, "Bash");
                assert_eq!(arguments["command"], "ls");
            }
            other => panic!("expected tool.complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn task_tool_maps_to_subagent_lifecycle() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_task","name":"Task","input":{"description":"explore the repo","prompt":"look around"}}]}}"#,
        )
        .await;
        // Nested work inside the Task span carries parent_tool_use_id.
        pump.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"inside"}]},"parent_tool_use_id":"toolu_task"}"#,
        )
        .await;
        pump.handle_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_task","content":[{"type":"text","text":"done"}],"is_error":false}]}}"#,
        )
        .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind(), EventKind::SubagentStart);
        assert_eq!(events[1].kind(), EventKind::MessageComplete);
        assert_eq!(events[1].scope, EventScope::delegate("dlg_toolu_task"));
        assert_eq!(events[2].kind(), EventKind::SubagentComplete);
        match &events[2].payload {
            EventPayload::SubagentComplete {
                status, summary, ..
            } => {
                assert_eq!(*status, DelegateStatus::Completed);
                assert_eq!(summary.as_deref(), Some("done"));
            }
            other => panic!("expected subagent.complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn result_emits_usage_then_idle() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.shared.turn_open.store(true, Ordering::SeqCst);
        pump.handle_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"all set","usage":{"input_tokens":120,"output_tokens":45}}"#,
        )
        .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::Usage);
        assert_eq!(events[1].kind(), EventKind::SessionIdle);
        assert!(!pump.shared.turn_open.load(Ordering::SeqCst));
        assert_eq!(
            pump.shared.usage.lock().await.map(|u| u.total()),
            Some(165)
        );
    }

    #[tokio::test]
    async fn can_use_tool_auto_approves() {
        let (mut pump, mut rx, mut writer) = pump_fixture();
        pump.handle_line(
            r#"{"type":"control_request","request_id":"req_7","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"cargo check"}}}"#,
        )
        .await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::PermissionRequested);

        let reply = writer.try_recv().expect("auto reply written");
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["response"]["request_id"], "req_7");
        assert_eq!(value["response"]["response"]["behavior"], "allow");
    }

    #[tokio::test]
    async fn deny_mode_rejects_permission_requests() {
        let (tx, _rx) = broadcast::channel(64);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let mut pump = MessagePump {
            emitter: Arc::new(Emitter::new(tx)),
            session_id: Some("ses_test".to_string()),
            ready: None,
            writer: writer_tx,
            shared: Arc::new(SessionShared::new(PermissionMode::Deny)),
        };
        pump.handle_line(
            r#"{"type":"control_request","request_id":"req_8","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{}}}"#,
        )
        .await;

        let reply = writer_rx.try_recv().expect("auto reply written");
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["response"]["response"]["behavior"], "deny");
    }

    #[tokio::test]
    async fn malformed_line_counts_protocol_mismatch() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.handle_line("{not json").await;
        pump.handle_line(r#"{"type":"wholly_new_thing","data":1}"#).await;

        assert!(drain(&mut rx).await.is_empty());
        // Malformed input counts; an unknown-but-parseable type is ignored.
        assert_eq!(pump.emitter.mismatch_count(), 1);
    }

    #[tokio::test]
    async fn stream_close_resolves_open_calls_and_turn() {
        let (mut pump, mut rx, _writer) = pump_fixture();
        pump.shared.turn_open.store(true, Ordering::SeqCst);
        pump.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_9","name":"Bash","input":{}}]}}"#,
        )
        .await;
        pump.handle_stream_closed("backend process exited").await;

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind(), EventKind::ToolStart);
        assert_eq!(events[1].kind(), EventKind::ToolComplete);
        assert_eq!(events[2].kind(), EventKind::SessionError);
    }
}
