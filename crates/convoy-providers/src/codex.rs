// Codex Adapter
// One `codex proto` subprocess per session. Submissions go down stdin as
// `{"id", "op"}` lines; events come back as `{"id", "msg"}` with a typed
// `msg`. Exec completions omit the command, so the correlation cache does
// the name replay for tool.complete.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use convoy_types::{
    ContextUsage, DelegateStatus, EventPayload, EventScope, PermissionMode, SessionConfig,
};

use crate::normalize::{Emitter, ToolCallTracker};
use crate::{AdapterCapabilities, BackendAdapter, ProviderError, Result};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CodexAdapter {
    emitter: Arc<Emitter>,
    binary: String,
    sessions: RwLock<HashMap<String, Arc<CodexSession>>>,
}

struct CodexSession {
    writer: mpsc::UnboundedSender<String>,
    child: Mutex<Child>,
    shared: Arc<CodexShared>,
    cancel: CancellationToken,
}

struct CodexShared {
    permission_mode: PermissionMode,
    turn_open: AtomicBool,
    tracker: Mutex<ToolCallTracker>,
    /// MCP tools that represent delegation rather than plain tool use.
    delegate_tools: HashSet<String>,
    /// call_id -> delegate id for delegate-tool spans in flight.
    delegate_calls: Mutex<HashMap<String, String>>,
    usage: Mutex<Option<ContextUsage>>,
}

impl CodexShared {
    fn new(config: &SessionConfig) -> Self {
        Self {
            permission_mode: config.permission_mode,
            turn_open: AtomicBool::new(false),
            tracker: Mutex::new(ToolCallTracker::new()),
            delegate_tools: config
                .tools
                .iter()
                .filter(|t| t.delegation)
                .map(|t| t.name.clone())
                .collect(),
            delegate_calls: Mutex::new(HashMap::new()),
            usage: Mutex::new(None),
        }
    }
}

impl CodexAdapter {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self::with_binary(emitter, "codex")
    }

    pub fn with_binary(emitter: Arc<Emitter>, binary: impl Into<String>) -> Self {
        Self {
            emitter,
            binary: binary.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn session(&self, session_id: &str) -> Result<Arc<CodexSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownSession(session_id.to_string()))
    }

    fn submit(writer: &mpsc::UnboundedSender<String>, op: Value) -> Result<()> {
        let submission = json!({ "id": Uuid::new_v4().to_string(), "op": op });
        writer
            .send(submission.to_string())
            .map_err(|_| ProviderError::Transport("codex stdin writer closed".to_string()))
    }
}

#[async_trait]
impl BackendAdapter for CodexAdapter {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_structural_delegation: false,
            supports_resume: false,
        }
    }

    async fn create_session(&self, config: SessionConfig) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command.arg("proto");
        if let Some(model) = &config.model {
            command.arg("-c").arg(format!("model={}", model));
        }
        if let Some(system_prompt) = &config.system_prompt {
            command
                .arg("-c")
                .arg(format!("instructions={}", system_prompt));
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
            .map_err(|e| ProviderError::Transport(format!("failed to spawn codex: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Transport("codex stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Transport("codex stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = "codex", line = %line, "backend stderr");
                }
            });
        }

        let writer = spawn_writer(stdin);
        let shared = Arc::new(CodexShared::new(&config));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut pump = CodexPump {
            emitter: self.emitter.clone(),
            session_id: None,
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
                        Ok(Some(line)) => {
                            if pump.handle_line(&line).await == PumpFlow::Stop {
                                return;
                            }
                        }
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

        let session_id = match tokio::time::timeout(INIT_TIMEOUT, ready_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) | Err(_) => {
                cancel.cancel();
                let _ = child.kill().await;
                return Err(ProviderError::Transport(
                    "timed out waiting for codex session_configured".to_string(),
                ));
            }
        };

        let session = Arc::new(CodexSession {
            writer,
            child: Mutex::new(child),
            shared,
            cancel,
        });
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);

        self.emitter
            .emit(
                &session_id,
                EventScope::TopLevel,
                EventPayload::SessionStart {
                    provider: "codex".to_string(),
                    resumed: false,
                },
            )
            .await;
        Ok(session_id)
    }

    async fn resume_session(&self, _session_id: &str, _config: SessionConfig) -> Result<String> {
        Err(ProviderError::Unsupported("session resume".to_string()))
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        session.shared.turn_open.store(true, Ordering::SeqCst);
        Self::submit(
            &session.writer,
            json!({
                "type": "user_input",
                "items": [{ "type": "text", "text": prompt }],
            }),
        )
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        Self::submit(&session.writer, json!({ "type": "interrupt" }))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return Ok(());
        };
        let _ = Self::submit(&session.writer, json!({ "type": "shutdown" }));
        session.cancel.cancel();
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

    async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>> {
        let session = self.session(session_id).await?;
        let usage = *session.shared.usage.lock().await;
        Ok(usage)
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: String,
    msg: RawCodexMsg,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawCodexMsg {
    SessionConfigured {
        session_id: String,
    },
    TaskStarted {},
    AgentMessageDelta {
        delta: String,
    },
    AgentMessage {
        message: String,
    },
    AgentReasoningDelta {},
    AgentReasoning {},
    ExecCommandBegin {
        call_id: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i64,
    },
    McpToolCallBegin {
        call_id: String,
        invocation: RawMcpInvocation,
    },
    McpToolCallEnd {
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    ExecApprovalRequest {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ApplyPatchApprovalRequest {
        #[serde(default)]
        changes: Value,
    },
    TokenCount {
        #[serde(default)]
        info: Option<RawTokenInfo>,
    },
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    TurnAborted {},
    Error {
        message: String,
    },
    ShutdownComplete {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawMcpInvocation {
    #[serde(default)]
    server: String,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct RawTokenInfo {
    total_token_usage: RawTokenUsage,
    #[serde(default)]
    model_context_window: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum PumpFlow {
    Continue,
    Stop,
}

// ============================================================================
// Reader-side translation
// ============================================================================

struct CodexPump {
    emitter: Arc<Emitter>,
    session_id: Option<String>,
    ready: Option<oneshot::Sender<String>>,
    writer: mpsc::UnboundedSender<String>,
    shared: Arc<CodexShared>,
}

impl CodexPump {
    async fn handle_line(&mut self, line: &str) -> PumpFlow {
        let envelope: RawEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.emitter
                    .record_mismatch("codex", &format!("unparseable line: {}", error));
                return PumpFlow::Continue;
            }
        };
        self.handle_msg(&envelope.id, envelope.msg).await
    }

    async fn handle_msg(&mut self, event_id: &str, msg: RawCodexMsg) -> PumpFlow {
        match msg {
            RawCodexMsg::SessionConfigured { session_id } => {
                if self.session_id.is_none() {
                    self.session_id = Some(session_id.clone());
                }
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(session_id);
                }
            }
            RawCodexMsg::TaskStarted {} => {}
            RawCodexMsg::AgentMessageDelta { delta } => {
                self.emit(EventPayload::MessageDelta {
                    message_id: None,
                    text: delta,
                })
                .await;
            }
            RawCodexMsg::AgentMessage { message } => {
                self.emit(EventPayload::MessageComplete {
                    message_id: None,
                    text: message,
                })
                .await;
            }
            RawCodexMsg::AgentReasoningDelta {} | RawCodexMsg::AgentReasoning {} => {}
            RawCodexMsg::ExecCommandBegin {
                call_id,
                command,
                cwd,
            } => {
                let arguments = json!({ "command": command, "cwd": cwd });
                let started = self.shared.tracker.lock().await.begin(
                    &call_id,
                    "shell",
                    arguments,
                    EventScope::TopLevel,
                );
                match started {
                    Some((scope, payload)) => self.emit_scoped(scope, payload).await,
                    None => self
                        .emitter
                        .record_mismatch("codex", &format!("duplicate exec begin {}", call_id)),
                }
            }
            RawCodexMsg::ExecCommandEnd {
                call_id,
                stdout,
                stderr,
                exit_code,
            } => {
                // The end event names nothing; the cache supplies the
                // command from the begin edge.
                let output = json!({ "stdout": stdout, "stderr": stderr, "exit_code": exit_code });
                let error =
                    (exit_code != 0).then(|| format!("command exited with status {}", exit_code));
                let events = self.shared.tracker.lock().await.complete(
                    &call_id,
                    None,
                    Some(output),
                    error,
                    EventScope::TopLevel,
                );
                if events.is_empty() {
                    self.emitter
                        .record_mismatch("codex", &format!("duplicate exec end {}", call_id));
                }
                for (scope, payload) in events {
                    self.emit_scoped(scope, payload).await;
                }
            }
            RawCodexMsg::McpToolCallBegin {
                call_id,
                invocation,
            } => {
                if self.shared.delegate_tools.contains(&invocation.tool) {
                    let delegate_id = format!("dlg_{}", call_id);
                    self.shared
                        .delegate_calls
                        .lock()
                        .await
                        .insert(call_id, delegate_id.clone());
                    let task = invocation
                        .arguments
                        .get("description")
                        .or_else(|| invocation.arguments.get("prompt"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    self.emit_scoped(
                        EventScope::delegate(&delegate_id),
                        EventPayload::SubagentStart { delegate_id, task },
                    )
                    .await;
                } else {
                    let name = if invocation.server.is_empty() {
                        invocation.tool.clone()
                    } else {
                        format!("{}.{}", invocation.server, invocation.tool)
                    };
                    let started = self.shared.tracker.lock().await.begin(
                        &call_id,
                        &name,
                        invocation.arguments,
                        EventScope::TopLevel,
                    );
                    match started {
                        Some((scope, payload)) => self.emit_scoped(scope, payload).await,
                        None => self.emitter.record_mismatch(
                            "codex",
                            &format!("duplicate mcp begin {}", call_id),
                        ),
                    }
                }
            }
            RawCodexMsg::McpToolCallEnd { call_id, result } => {
                let delegate = self.shared.delegate_calls.lock().await.remove(&call_id);
                if let Some(delegate_id) = delegate {
                    let is_error = result
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let status = if is_error {
                        DelegateStatus::Error
                    } else {
                        DelegateStatus::Completed
                    };
                    let summary = mcp_result_text(&result);
                    self.emit_scoped(
                        EventScope::delegate(&delegate_id),
                        EventPayload::SubagentComplete {
                            delegate_id: delegate_id.clone(),
                            status,
                            summary,
                        },
                    )
                    .await;
                } else {
                    let is_error = result
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let error = is_error.then(|| {
                        mcp_result_text(&result).unwrap_or_else(|| "tool call failed".to_string())
                    });
                    let output = (!is_error).then(|| result.clone());
                    let events = self.shared.tracker.lock().await.complete(
                        &call_id,
                        None,
                        output,
                        error,
                        EventScope::TopLevel,
                    );
                    if events.is_empty() {
                        self.emitter
                            .record_mismatch("codex", &format!("duplicate mcp end {}", call_id));
                    }
                    for (scope, payload) in events {
                        self.emit_scoped(scope, payload).await;
                    }
                }
            }
            RawCodexMsg::ExecApprovalRequest { command, cwd } => {
                self.handle_approval(
                    event_id,
                    "shell",
                    json!({ "command": command, "cwd": cwd }),
                    "exec_approval",
                )
                .await;
            }
            RawCodexMsg::ApplyPatchApprovalRequest { changes } => {
                self.handle_approval(event_id, "apply_patch", changes, "patch_approval")
                    .await;
            }
            RawCodexMsg::TokenCount { info } => {
                if let Some(info) = info {
                    let usage = ContextUsage {
                        input_tokens: info.total_token_usage.input_tokens,
                        output_tokens: info.total_token_usage.output_tokens,
                        context_window: info.model_context_window,
                    };
                    *self.shared.usage.lock().await = Some(usage);
                    self.emit(EventPayload::Usage { usage }).await;
                }
            }
            RawCodexMsg::TaskComplete { last_agent_message } => {
                let _ = last_agent_message;
                self.shared.turn_open.store(false, Ordering::SeqCst);
                self.emit(EventPayload::SessionIdle {}).await;
            }
            RawCodexMsg::TurnAborted {} => {
                // An abort still resolves the turn; the facade decides what
                // it means.
                self.shared.turn_open.store(false, Ordering::SeqCst);
                self.emit(EventPayload::SessionIdle {}).await;
            }
            RawCodexMsg::Error { message } => {
                self.shared.turn_open.store(false, Ordering::SeqCst);
                self.emit(EventPayload::SessionError { message }).await;
            }
            RawCodexMsg::ShutdownComplete {} => return PumpFlow::Stop,
            RawCodexMsg::Unknown => {
                tracing::debug!(backend = "codex", "ignoring unmapped event type");
            }
        }
        PumpFlow::Continue
    }

    async fn handle_approval(&mut self, event_id: &str, tool: &str, arguments: Value, op: &str) {
        self.emit(EventPayload::PermissionRequested {
            request_id: event_id.to_string(),
            tool: tool.to_string(),
            arguments,
        })
        .await;

        let decision = match self.shared.permission_mode {
            PermissionMode::AutoApprove => "approved",
            PermissionMode::Deny => "denied",
        };
        let submission = json!({
            "id": Uuid::new_v4().to_string(),
            "op": { "type": op, "id": event_id, "decision": decision },
        });
        let _ = self.writer.send(submission.to_string());
    }

    async fn handle_stream_closed(&mut self, reason: &str) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let orphans = self.shared.tracker.lock().await.resolve_open(reason);
        for (scope, payload) in orphans {
            self.emitter.emit(&session_id, scope, payload).await;
        }
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
        }
    }

    async fn emit(&self, payload: EventPayload) {
        self.emit_scoped(EventScope::TopLevel, payload).await;
    }

    async fn emit_scoped(&self, scope: EventScope, payload: EventPayload) {
        let Some(session_id) = &self.session_id else {
            tracing::debug!(backend = "codex", "dropping event before session_configured");
            return;
        };
        self.emitter.emit(session_id, scope, payload).await;
    }
}

fn spawn_writer(mut stdin: tokio::process::ChildStdin) -> mpsc::UnboundedSender<String> {
    use tokio::io::AsyncWriteExt;
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

/// Pull readable text out of an MCP tool result's content blocks.
fn mcp_result_text(result: &Value) -> Option<String> {
    let blocks = result.get("content")?.as_array()?;
    let mut out = String::new();
    for block in blocks {
        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
            out.push_str(text);
        }
    }
    (!out.is_empty()).then_some(out)
}
