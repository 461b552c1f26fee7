// Canonical Event Schema
// Every provider adapter normalizes its native wire format into this shape.
// Consumers (orchestrator, routers, UI, telemetry) never see provider-native events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A normalized event emitted for one canonical session.
///
/// `sequence` is monotonic per session and assigned at publication; consumers
/// must not reorder. Delegate-originated events carry the parent session's id
/// with a `delegate:<id>` scope, so one session has one sequence stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub scope: EventScope,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    /// True when this event resolves the in-flight turn on its session.
    pub fn ends_turn(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::SessionIdle {} | EventPayload::SessionError { .. }
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Origin of an event: the session's own turn, or a delegate running under it.
///
/// The scope is stamped by the adapter at the point of emission from its own
/// protocol-level correlation. It is never derived from "is some delegate
/// currently running" state downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventScope {
    TopLevel,
    Delegate(String),
}

impl EventScope {
    pub fn delegate(id: impl Into<String>) -> Self {
        EventScope::Delegate(id.into())
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self, EventScope::Delegate(_))
    }

    pub fn delegate_id(&self) -> Option<&str> {
        match self {
            EventScope::TopLevel => None,
            EventScope::Delegate(id) => Some(id),
        }
    }
}

impl fmt::Display for EventScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventScope::TopLevel => write!(f, "top-level"),
            EventScope::Delegate(id) => write!(f, "delegate:{}", id),
        }
    }
}

impl FromStr for EventScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "top-level" {
            return Ok(EventScope::TopLevel);
        }
        match s.strip_prefix("delegate:") {
            Some(id) if !id.is_empty() => Ok(EventScope::Delegate(id.to_string())),
            _ => Err(format!("invalid event scope: {}", s)),
        }
    }
}

impl Serialize for EventScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The fixed canonical event variant set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    /// Session established (or re-attached on resume).
    #[serde(rename = "session.start")]
    SessionStart { provider: String, resumed: bool },
    /// Explicit turn-completion signal from the backend. The only legitimate
    /// way a turn finishes; content arrival never implies completion.
    #[serde(rename = "session.idle")]
    SessionIdle {},
    #[serde(rename = "session.error")]
    SessionError { message: String },
    /// Incremental assistant text.
    #[serde(rename = "message.delta")]
    MessageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        text: String,
    },
    /// A whole assistant message (providers that emit blocks rather than deltas
    /// produce these directly).
    #[serde(rename = "message.complete")]
    MessageComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        text: String,
    },
    /// Exactly one per logical tool invocation, paired by `call_id`.
    #[serde(rename = "tool.start")]
    ToolStart {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Exactly one per logical tool invocation. `name` and `arguments` are
    /// replayed from the adapter's correlation cache when the vendor omits
    /// them on the completion edge.
    #[serde(rename = "tool.complete")]
    ToolComplete {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "subagent.start")]
    SubagentStart {
        delegate_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    #[serde(rename = "subagent.complete")]
    SubagentComplete {
        delegate_id: String,
        status: crate::delegate::DelegateStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename = "permission.requested")]
    PermissionRequested {
        request_id: String,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    #[serde(rename = "human_input_required")]
    HumanInputRequired { request_id: String, question: String },
    #[serde(rename = "usage")]
    Usage { usage: ContextUsage },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionStart { .. } => EventKind::SessionStart,
            EventPayload::SessionIdle {} => EventKind::SessionIdle,
            EventPayload::SessionError { .. } => EventKind::SessionError,
            EventPayload::MessageDelta { .. } => EventKind::MessageDelta,
            EventPayload::MessageComplete { .. } => EventKind::MessageComplete,
            EventPayload::ToolStart { .. } => EventKind::ToolStart,
            EventPayload::ToolComplete { .. } => EventKind::ToolComplete,
            EventPayload::SubagentStart { .. } => EventKind::SubagentStart,
            EventPayload::SubagentComplete { .. } => EventKind::SubagentComplete,
            EventPayload::PermissionRequested { .. } => EventKind::PermissionRequested,
            EventPayload::HumanInputRequired { .. } => EventKind::HumanInputRequired,
            EventPayload::Usage { .. } => EventKind::Usage,
        }
    }

    /// Correlation id for tool events, if this is one.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            EventPayload::ToolStart { call_id, .. } => Some(call_id),
            EventPayload::ToolComplete { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Discriminant-only view of the canonical event types, useful for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SessionStart,
    SessionIdle,
    SessionError,
    MessageDelta,
    MessageComplete,
    ToolStart,
    ToolComplete,
    SubagentStart,
    SubagentComplete,
    PermissionRequested,
    HumanInputRequired,
    Usage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session.start",
            EventKind::SessionIdle => "session.idle",
            EventKind::SessionError => "session.error",
            EventKind::MessageDelta => "message.delta",
            EventKind::MessageComplete => "message.complete",
            EventKind::ToolStart => "tool.start",
            EventKind::ToolComplete => "tool.complete",
            EventKind::SubagentStart => "subagent.start",
            EventKind::SubagentComplete => "subagent.complete",
            EventKind::PermissionRequested => "permission.requested",
            EventKind::HumanInputRequired => "human_input_required",
            EventKind::Usage => "usage",
        }
    }
}

/// Token accounting reported by the backend for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

impl ContextUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_string_roundtrip() {
        assert_eq!(EventScope::TopLevel.to_string(), "top-level");
        assert_eq!(
            EventScope::delegate("dlg_1").to_string(),
            "delegate:dlg_1"
        );

        let parsed: EventScope = "delegate:dlg_1".parse().unwrap();
        assert_eq!(parsed, EventScope::delegate("dlg_1"));
        assert!("delegate:".parse::<EventScope>().is_err());
        assert!("ambient".parse::<EventScope>().is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = AgentEvent {
            session_id: "ses_1".to_string(),
            sequence: 7,
            timestamp: chrono::Utc::now(),
            scope: EventScope::delegate("dlg_9"),
            payload: EventPayload::ToolStart {
                call_id: "call_1".to_string(),
                name: "shell".to_string(),
                arguments: serde_json::json!({ "command": "ls" }),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sessionId"], "ses_1");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["scope"], "delegate:dlg_9");
        assert_eq!(value["type"], "tool.start");
        assert_eq!(value["data"]["call_id"], "call_1");

        let back: AgentEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), EventKind::ToolStart);
        assert_eq!(back.payload.tool_call_id(), Some("call_1"));
    }

    #[test]
    fn test_ends_turn() {
        let idle = EventPayload::SessionIdle {};
        let delta = EventPayload::MessageDelta {
            message_id: None,
            text: "done!".to_string(),
        };
        let event = |payload| AgentEvent {
            session_id: "s".to_string(),
            sequence: 0,
            timestamp: chrono::Utc::now(),
            scope: EventScope::TopLevel,
            payload,
        };

        assert!(event(idle).ends_turn());
        // Content arrival never implies turn completion.
        assert!(!event(delta).ends_turn());
    }
}
