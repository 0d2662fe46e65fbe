//! Error types for dispatch rounds.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that abort a dispatch round.
///
/// Everything recoverable (malformed results, lost replies, maintenance
/// hiccups) is logged and absorbed instead; only a dead endpoint ends the
/// round, and the caller answers that with a full round restart.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport failed mid-round: {0}")]
    Wire(#[from] drover_wire::WireError),
}
