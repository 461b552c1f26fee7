// Shared Convoy data types
// Canonical event schema, task model, delegate handles, and workflow state
// used by the provider adapters and the orchestration core.

pub mod delegate;
pub mod event;
pub mod session;
pub mod task;
pub mod workflow;

pub use delegate::{DelegateHandle, DelegateKind, DelegateStatus, DelegateTask};
pub use event::{AgentEvent, ContextUsage, EventKind, EventPayload, EventScope};
pub use session::{PermissionMode, SessionConfig, ToolRegistration};
pub use task::{Task, TaskStatus};
pub use workflow::{
    Checkpoint, IterationRecord, TerminalOutcome, TurnOutcome, WorkflowEvent, WorkflowLimits,
    WorkflowPhase, WorkflowRun,
};
