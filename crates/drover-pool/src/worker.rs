//! Worker bookkeeping — ids, resource specs, and the per-worker state
//! machine the pool reconciles against scheduler observations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::JobId;

/// Identifier unique within a pool's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    fn new(run_tag: u32, seq: u32) -> Self {
        Self(format!("worker-{run_tag:06x}-{seq:03}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out worker ids: a random per-pool run tag plus a monotonic
/// sequence, so ids never collide however many workers a pool churns
/// through.
#[derive(Debug)]
pub struct IdGenerator {
    run_tag: u32,
    next_seq: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            run_tag: rand::random::<u32>() & 0xff_ffff,
            next_seq: 0,
        }
    }

    pub fn next_id(&mut self) -> WorkerId {
        let id = WorkerId::new(self.run_tag, self.next_seq);
        self.next_seq += 1;
        id
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// What one worker asks the scheduler for.
///
/// Fixed at worker creation; a restarted worker is resubmitted with
/// exactly this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cores: u32,
    pub memory_gb: u32,
    #[serde(with = "duration_secs")]
    pub walltime: Duration,
    pub queue: String,
    /// Hosts the scheduler must avoid.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ResourceSpec {
    pub fn new(cores: u32, memory_gb: u32, walltime: Duration, queue: impl Into<String>) -> Self {
        Self {
            cores,
            memory_gb,
            walltime,
            queue: queue.into(),
            exclude: Vec::new(),
        }
    }

    pub fn with_exclude(mut self, hosts: Vec<String>) -> Self {
        self.exclude = hosts;
        self
    }
}

/// Lifecycle state of a managed worker.
///
/// `ToSubmit` holds workers parked by the congestion-avoiding policy or
/// the restart cap; `Faulty` is terminal and only ever entered after
/// three consecutive polls failed to find a worker the pool expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Unsubmitted,
    ToSubmit,
    Pending,
    Running,
    Completing,
    Terminated,
    Faulty,
}

impl WorkerState {
    /// Submitted to the scheduler and expected to show up in status
    /// output.
    pub fn is_submitted(&self) -> bool {
        matches!(
            self,
            WorkerState::Pending | WorkerState::Running | WorkerState::Completing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Faulty)
    }
}

/// One managed worker and everything the pool knows about it.
#[derive(Debug, Clone)]
pub struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) resources: ResourceSpec,
    pub(crate) state: WorkerState,
    pub(crate) job: Option<JobId>,
    pub(crate) submissions: u32,
    pub(crate) last_elapsed: Option<Duration>,
    pub(crate) missed_polls: u32,
    pub(crate) stdout_log: PathBuf,
    pub(crate) stderr_log: PathBuf,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, resources: ResourceSpec, log_dir: &Path) -> Self {
        let stdout_log = log_dir.join(format!("{id}_out.log"));
        let stderr_log = log_dir.join(format!("{id}_err.log"));
        Self {
            id,
            resources,
            state: WorkerState::Unsubmitted,
            job: None,
            submissions: 0,
            last_elapsed: None,
            missed_polls: 0,
            stdout_log,
            stderr_log,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The spec this worker was created with. Never changes.
    pub fn resources(&self) -> &ResourceSpec {
        &self.resources
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn job(&self) -> Option<&JobId> {
        self.job.as_ref()
    }

    /// How many times this worker has been handed to the scheduler,
    /// restarts included.
    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    /// Most recent scheduler-reported runtime.
    pub fn last_elapsed(&self) -> Option<Duration> {
        self.last_elapsed
    }

    pub fn stdout_log(&self) -> &Path {
        &self.stdout_log
    }

    pub fn stderr_log(&self) -> &Path {
        &self.stderr_log
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let mut ids = IdGenerator::new();
        let all: Vec<WorkerId> = (0..100).map(|_| ids.next_id()).collect();
        let mut dedup = all.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 100);
        assert!(all[0].as_str().starts_with("worker-"));
        assert!(all[0] < all[1]);
    }

    #[test]
    fn log_paths_derive_from_the_id() {
        let mut ids = IdGenerator::new();
        let id = ids.next_id();
        let spec = ResourceSpec::new(1, 4, Duration::from_secs(3600), "short");
        let worker = Worker::new(id.clone(), spec, Path::new("/tmp/logs"));
        assert_eq!(
            worker.stdout_log(),
            Path::new(&format!("/tmp/logs/{id}_out.log"))
        );
        assert_eq!(
            worker.stderr_log(),
            Path::new(&format!("/tmp/logs/{id}_err.log"))
        );
    }

    #[test]
    fn resource_spec_serde_round_trip() {
        let spec = ResourceSpec::new(4, 16, Duration::from_secs(7200), "batch")
            .with_exclude(vec!["node07".into()]);
        let bytes = bincode::serialize(&spec).unwrap();
        let back: ResourceSpec = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, spec);
    }
}
