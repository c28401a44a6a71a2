use crate::domain::{ActionId, ActionStatus};

/// Core error type.
///
/// Adapter crates map their driver errors into this type so the claim loop can
/// tell a store outage (back off and retry the cycle) from a lost race on a
/// single row (log and move on).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("action not found: {id}")]
    NotFound { id: ActionId },

    #[error("cannot {op} action {id} in status {from}")]
    InvalidTransition {
        id: ActionId,
        from: ActionStatus,
        op: &'static str,
    },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether a whole poll/reap cycle should be retried after a backoff.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome reported by an [`ActionExecutor`](crate::executor::ActionExecutor).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Retryable: the action goes back to pending until `max_retries` is spent.
    #[error("transient execution error: {0}")]
    Transient(String),

    /// Non-retryable: the action becomes `failed` immediately.
    #[error("permanent execution error: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            ExecutionError::Transient(r) | ExecutionError::Permanent(r) => r,
        }
    }
}
