//! Scheduler backend capability — the seam between the pool and a cluster.
//!
//! Drivers submit, bulk-query, and cancel jobs. Everything they report
//! crosses this boundary as typed values; raw scheduler CLI output never
//! does. Only the pool interprets [`JobState::NotFound`] — a driver never
//! guesses what a missing job means.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::worker::ResourceSpec;

/// Result type alias for backend drivers.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors a scheduler driver can surface.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("status query failed: {0}")]
    Status(String),

    #[error("cancel failed: {0}")]
    Cancel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduler-assigned job identifier, opaque to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a driver needs to submit one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Job name; the pool uses the worker id.
    pub name: String,
    /// Command line the job runs.
    pub command: String,
    pub resources: ResourceSpec,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

/// Job states a driver may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    NotFound,
}

/// One job's observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    /// Scheduler-reported runtime, where the backend exposes one.
    pub elapsed: Option<Duration>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            elapsed: None,
        }
    }

    pub fn running(elapsed: Option<Duration>) -> Self {
        Self {
            state: JobState::Running,
            elapsed,
        }
    }

    pub fn completing() -> Self {
        Self {
            state: JobState::Completing,
            elapsed: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            state: JobState::NotFound,
            elapsed: None,
        }
    }
}

/// Capability the pool manager drives a cluster through.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// Submit one worker process.
    async fn submit(&self, request: &JobRequest) -> BackendResult<JobId>;

    /// Bulk-query the given jobs. Ids absent from the returned map are
    /// treated as [`JobState::NotFound`].
    async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>>;

    /// Cancel a job. Cancelling an already-gone job is not an error.
    async fn cancel(&self, job: &JobId) -> BackendResult<()>;

    /// Remove transient driver artifacts (status files, rendered scripts).
    async fn cleanup(&self) -> BackendResult<()> {
        Ok(())
    }
}
