// Convoy orchestration core
// The canonical session facade, the persisted task store, delegate dispatch,
// and the workflow engine that drives decompose/implement/review runs over
// any registered backend adapter. Everything here consumes canonical events
// from the shared hub; provider-native shapes never cross into this crate.

pub mod dispatch;
pub mod error;
pub mod hub;
pub mod router;
pub mod session;
pub mod store;
pub mod workflow;

pub use dispatch::{DelegateDispatcher, Dispatch, RoutingPolicy};
pub use error::{ConvoyError, Result};
pub use hub::EventHub;
pub use router::TaskEventRouter;
pub use session::{RetryPolicy, SessionManager, SessionStream, TurnToken};
pub use store::TaskStore;
pub use workflow::{
    default_data_dir, RunStore, WorkflowHandle, WorkflowManager, WorkflowOptions,
};
