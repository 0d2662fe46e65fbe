//! drover-pool — adaptive lifecycle management for scheduler-backed
//! workers.
//!
//! A [`WorkerPool`] reconciles the workers it wants against what the
//! scheduler actually reports through a [`SchedulerBackend`]: it grows the
//! herd under one of three policies (plain, congestion-avoiding,
//! backlog-draining), restarts workers before their walltime expires, and
//! retires workers the scheduler has forgotten. Drivers live behind the
//! [`SchedulerBackend`] trait and only ever report typed job states.

pub mod backend;
pub mod error;
pub mod options;
pub mod pool;
pub mod worker;

pub use backend::{
    BackendError, BackendResult, JobId, JobRequest, JobState, JobStatus, SchedulerBackend,
};
pub use error::{PoolError, PoolResult};
pub use options::PoolOptions;
pub use pool::{GrowthPolicy, RestartOutcome, WorkerPool};
pub use worker::{IdGenerator, ResourceSpec, Worker, WorkerId, WorkerState};
