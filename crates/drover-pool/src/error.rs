//! Error types for pool management.

use thiserror::Error;

use crate::backend::BackendError;
use crate::worker::WorkerId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while managing the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("submission failed for {worker}: {source}")]
    Submission {
        worker: WorkerId,
        #[source]
        source: BackendError,
    },

    #[error("status query failed after retry: {0}")]
    StatusQuery(#[source] BackendError),

    #[error("unknown worker {0}")]
    WorkerNotFound(WorkerId),
}
