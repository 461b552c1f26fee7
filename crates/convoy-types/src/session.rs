use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the session answers permission prompts that arrive mid-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Approve every request and surface it as an event.
    AutoApprove,
    /// Reject every request and surface it as an event.
    Deny,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::AutoApprove
    }
}

/// A tool exposed to the backend at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: serde_json::Value,
    /// Marks the tool as a delegation primitive: adapters without native
    /// delegation open a subagent span when the model invokes it.
    #[serde(default)]
    pub delegation: bool,
}

impl ToolRegistration {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            delegation: false,
        }
    }

    pub fn with_delegation(mut self) -> Self {
        self.delegation = true;
        self
    }
}

/// Options applied when a canonical session is created or resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// External tool servers the backend should attach, by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tools registered before the first prompt is sent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolRegistration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: None,
            permission_mode: PermissionMode::default(),
            tool_servers: Vec::new(),
            workspace: None,
            system_prompt: None,
            tools: Vec::new(),
        }
    }
}
