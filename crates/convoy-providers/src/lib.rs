// Backend Adapters
// Each adapter owns one backend's native protocol (hook-callback JSONL,
// status-tagged SSE, typed proto events) and translates it into canonical
// AgentEvents pushed through a shared Emitter. Nothing downstream of this
// crate ever sees a provider-native payload.

pub mod claude;
pub mod codex;
pub mod mock;
pub mod normalize;
pub mod opencode;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use convoy_types::{ContextUsage, DelegateTask, SessionConfig, ToolRegistration};

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use mock::{MockBackend, MockDelegateScript, MockEmit, MockTurn, TurnEnd};
pub use normalize::{Emitter, ToolCallTracker};
pub use opencode::OpenCodeAdapter;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Connection or process level failure. Safe to retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend sent something the adapter cannot interpret.
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether a retry of the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Capability flags a backend reports at registration. Callers branch on
/// these instead of matching on adapter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCapabilities {
    /// Backend can host delegates as a native primitive with stable ids
    /// known at dispatch time.
    pub supports_structural_delegation: bool,
    /// Backend can reattach to a previously created session by id.
    pub supports_resume: bool,
}

/// Uniform surface over heterogeneous agent backends.
///
/// Session ids returned here are canonical: they identify the session for
/// the rest of the system and stay stable across resume. All output flows
/// through the adapter's [`Emitter`] as canonical events; none of these
/// methods return backend payloads.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable adapter id used for routing and run records.
    fn id(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Bring up shared adapter state such as listeners or health checks.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down shared adapter state. Open sessions are destroyed first
    /// by the caller.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Create a backend session and return its canonical id.
    async fn create_session(&self, config: SessionConfig) -> Result<String>;

    /// Reattach to an existing session, preserving its canonical id.
    async fn resume_session(&self, session_id: &str, config: SessionConfig) -> Result<String>;

    /// Submit a prompt. Returns once the backend accepted it; the turn
    /// resolves later through `session.idle` or `session.error`.
    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()>;

    /// Ask the backend to stop generating. Backends differ in how promptly
    /// they honor this.
    async fn interrupt(&self, session_id: &str) -> Result<()>;

    async fn destroy_session(&self, session_id: &str) -> Result<()>;

    /// Expose a tool to a live session. Only meaningful where the protocol
    /// has a registration step; others bake tools in at session creation.
    async fn register_tool(&self, _session_id: &str, _tool: ToolRegistration) -> Result<()> {
        Err(ProviderError::Unsupported("tool registration".to_string()))
    }

    /// Spawn a structural delegate under the given session. The delegate's
    /// events arrive on the parent session with a `delegate:<id>` scope.
    async fn spawn_delegate(&self, _session_id: &str, _task: DelegateTask) -> Result<String> {
        Err(ProviderError::Unsupported(
            "structural delegation".to_string(),
        ))
    }

    /// Latest token accounting for the session, where the backend reports it.
    async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>>;
}
