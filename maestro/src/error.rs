use crate::job::{JobId, JobStatus};
use thiserror::Error;

/// Errors surfaced by the orchestrator and the job store.
///
/// Losing a CAS race is a normal outcome and is reported as
/// `Ok(false)` by the store, not as an error; `InvalidTransition` is
/// what the orchestrator returns once it has re-read the record and
/// confirmed the requested edge is not available from the current
/// state. Transient store failures propagate unchanged through the
/// `Store` variant.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("an active job already exists for idempotency key {0}")]
    DuplicateKey(String),

    #[error("job {id} is {from} and does not accept {event}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        event: &'static str,
    },

    #[error(
        "retry budget exhausted for job {id} ({retry_count}/{max_retries}); failure is permanent"
    )]
    RetryBudgetExhausted {
        id: JobId,
        retry_count: u16,
        max_retries: u16,
    },

    #[error("dispatch queue unavailable: {0}")]
    Dispatch(&'static str),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
