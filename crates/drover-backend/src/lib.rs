//! drover-backend — scheduler drivers behind the pool's backend seam.
//!
//! Three drivers implement [`SchedulerBackend`](drover_pool::SchedulerBackend):
//! [`SlurmBackend`] (sbatch/squeue/scancel), [`PbsBackend`]
//! (qsub/qstat/qdel), and [`SshBackend`] for plain hosts reachable over
//! ssh with no queueing system at all. Each one translates raw scheduler
//! output into typed [`JobStatus`](drover_pool::JobStatus) values at the
//! boundary; nothing downstream ever sees a status line.

pub mod hosts;
pub mod pbs;
mod script;
pub mod slurm;
pub mod ssh;

pub use hosts::HostRotation;
pub use pbs::{PbsBackend, PbsOptions};
pub use slurm::{SlurmBackend, SlurmOptions};
pub use ssh::{SshBackend, SshOptions};

use std::path::Path;
use tracing::warn;

/// Remove a driver artifact, tolerating one that never got written.
pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove driver artifact"),
    }
}
