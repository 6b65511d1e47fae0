//! Errors surfaced by [`Orchestrator`](crate::Orchestrator).

use thiserror::Error;

use crate::throttle::QueueTimeoutError;

/// Failure of one orchestrated request.
///
/// `E` is the fetcher's own error type. It is returned unchanged once retries
/// are exhausted, so callers can match on upstream status codes themselves.
#[derive(Debug, Error)]
pub enum OrchestratorError<E> {
    /// The request waited too long in the throttle queue and never ran.
    #[error(transparent)]
    QueueTimeout(#[from] QueueTimeoutError),

    #[error("Upstream call failed: {0}")]
    Upstream(E),
}

impl<E> OrchestratorError<E> {
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, OrchestratorError::QueueTimeout(_))
    }

    pub fn upstream(&self) -> Option<&E> {
        match self {
            OrchestratorError::Upstream(err) => Some(err),
            OrchestratorError::QueueTimeout(_) => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            OrchestratorError::Upstream(err) => Some(err),
            OrchestratorError::QueueTimeout(_) => None,
        }
    }
}
