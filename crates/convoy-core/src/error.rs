use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error(transparent)]
    Provider(#[from] convoy_providers::ProviderError),
    /// Reconciliation carried at least one id the store has never seen.
    /// The persisted file is left untouched.
    #[error("Task reconciliation rejected, unknown ids: {}", unknown_ids.join(", "))]
    TaskReconciliationRejected { unknown_ids: Vec<String> },
    /// Instructional dispatch deadline passed with no observed start.
    #[error("Delegation uncertain: no lifecycle signal from {delegate_id} before the deadline")]
    DelegationUncertain { delegate_id: String },
    #[error("Turn deadline elapsed before the backend signalled idle")]
    TurnTimeout,
    #[error("Unknown session: {0}")]
    UnknownSession(String),
    #[error("Unknown run: {0}")]
    UnknownRun(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvoyError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConvoyError::Provider(err) => err.is_recoverable(),
            ConvoyError::Io(_) | ConvoyError::TurnTimeout => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
