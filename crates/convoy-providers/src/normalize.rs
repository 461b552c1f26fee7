// Canonical event emission and tool-call pairing shared by all adapters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use convoy_types::{AgentEvent, EventPayload, EventScope};

/// Stamps sequence numbers and timestamps onto canonical events and fans
/// them out to subscribers. One emitter is shared by all sessions of an
/// adapter; sequence counters are tracked per session id, so delegate
/// events interleave into the parent session's single ordered stream.
pub struct Emitter {
    tx: broadcast::Sender<AgentEvent>,
    sequences: Mutex<HashMap<String, u64>>,
    protocol_mismatches: AtomicU64,
}

impl Emitter {
    pub fn new(tx: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            tx,
            sequences: Mutex::new(HashMap::new()),
            protocol_mismatches: AtomicU64::new(0),
        }
    }

    /// Publish one canonical event for a session. The sequence number is
    /// assigned here and is monotonic per session id.
    pub async fn emit(&self, session_id: &str, scope: EventScope, payload: EventPayload) {
        let sequence = {
            let mut sequences = self.sequences.lock().await;
            let counter = sequences.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let event = AgentEvent {
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            scope,
            payload,
        };
        // A send error only means no subscriber is currently attached.
        let _ = self.tx.send(event);
    }

    /// Count and log a backend payload the adapter could not interpret.
    /// The payload itself is dropped; the stream continues.
    pub fn record_mismatch(&self, adapter: &str, detail: &str) {
        self.protocol_mismatches.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(adapter, detail, "dropping malformed backend payload");
    }

    pub fn mismatch_count(&self) -> u64 {
        self.protocol_mismatches.load(Ordering::Relaxed)
    }

    /// Discard sequence state for a destroyed session.
    pub async fn forget_session(&self, session_id: &str) {
        self.sequences.lock().await.remove(session_id);
    }
}

/// Pairs `tool.start` and `tool.complete` edges for one session.
///
/// Backends disagree about what an end edge carries: some repeat the tool
/// name and arguments, some send only the call id. The tracker caches the
/// identity from the start edge so completions are always fully formed.
/// Duplicate starts are suppressed, a completion whose start was never
/// seen gets a synthesized start, and a second completion for the same
/// call id is dropped. Consumers therefore see exactly one start and one
/// complete per call id.
#[derive(Default)]
pub struct ToolCallTracker {
    open: HashMap<String, OpenCall>,
    closed: HashSet<String>,
}

struct OpenCall {
    name: String,
    arguments: serde_json::Value,
    scope: EventScope,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a start edge. Returns `None` when the call id is already
    /// open or closed; such a duplicate must not be emitted.
    pub fn begin(
        &mut self,
        call_id: &str,
        name: &str,
        arguments: serde_json::Value,
        scope: EventScope,
    ) -> Option<(EventScope, EventPayload)> {
        if self.open.contains_key(call_id) || self.closed.contains(call_id) {
            return None;
        }
        self.open.insert(
            call_id.to_string(),
            OpenCall {
                name: name.to_string(),
                arguments: arguments.clone(),
                scope: scope.clone(),
            },
        );
        Some((
            scope,
            EventPayload::ToolStart {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments,
            },
        ))
    }

    /// Record an end edge and return the events to emit in order. A paired
    /// completion reuses the cached name, arguments, and scope. An orphan
    /// end edge first yields a synthesized start. A duplicate end edge
    /// yields nothing.
    pub fn complete(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        output: Option<serde_json::Value>,
        error: Option<String>,
        scope: EventScope,
    ) -> Vec<(EventScope, EventPayload)> {
        if self.closed.contains(call_id) {
            return Vec::new();
        }
        self.closed.insert(call_id.to_string());

        match self.open.remove(call_id) {
            Some(call) => vec![(
                call.scope,
                EventPayload::ToolComplete {
                    call_id: call_id.to_string(),
                    name: call.name,
                    arguments: call.arguments,
                    output,
                    error,
                },
            )],
            None => {
                let name = name.unwrap_or("unknown").to_string();
                vec![
                    (
                        scope.clone(),
                        EventPayload::ToolStart {
                            call_id: call_id.to_string(),
                            name: name.clone(),
                            arguments: serde_json::Value::Null,
                        },
                    ),
                    (
                        scope,
                        EventPayload::ToolComplete {
                            call_id: call_id.to_string(),
                            name,
                            arguments: serde_json::Value::Null,
                            output,
                            error,
                        },
                    ),
                ]
            }
        }
    }

    /// Close every still-open call with the given error. Called when a
    /// session or delegate ends so consumers never see a dangling start.
    pub fn resolve_open(&mut self, reason: &str) -> Vec<(EventScope, EventPayload)> {
        let mut events = Vec::new();
        for (call_id, call) in self.open.drain() {
            self.closed.insert(call_id.clone());
            events.push((
                call.scope,
                EventPayload::ToolComplete {
                    call_id,
                    name: call.name,
                    arguments: call.arguments,
                    output: None,
                    error: Some(reason.to_string()),
                },
            ));
        }
        events
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
