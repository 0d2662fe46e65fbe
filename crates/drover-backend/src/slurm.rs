//! Slurm driver — sbatch submission, bulk squeue polling, scancel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use drover_pool::{BackendError, BackendResult, JobId, JobRequest, JobStatus, SchedulerBackend};

use crate::{remove_quietly, script};

/// Tuning for [`SlurmBackend`]. Command names resolve through `$PATH`
/// unless given as absolute paths.
#[derive(Debug, Clone)]
pub struct SlurmOptions {
    pub sbatch: String,
    pub squeue: String,
    pub scancel: String,
    /// User whose queue to poll; defaults to `$USER` at construction.
    pub user: Option<String>,
    /// Where rendered batch scripts are written.
    pub script_dir: PathBuf,
    /// Mirror raw squeue output here on every poll, for inspection while
    /// a long round runs.
    pub status_file: Option<PathBuf>,
    /// Pause after each accepted submission. Rapid-fire sbatch calls are
    /// a good way to get rate-limited by the controller.
    pub submit_delay: Duration,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".into(),
            squeue: "squeue".into(),
            scancel: "scancel".into(),
            user: None,
            script_dir: PathBuf::from("."),
            status_file: None,
            submit_delay: Duration::from_millis(500),
        }
    }
}

impl SlurmOptions {
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }
}

/// Drives a Slurm cluster. Jobs are identified by the id sbatch prints;
/// host exclusion rides on the native `--exclude` directive.
pub struct SlurmBackend {
    options: SlurmOptions,
    user: Option<String>,
    scripts: Mutex<Vec<PathBuf>>,
}

impl SlurmBackend {
    pub fn new(options: SlurmOptions) -> Self {
        let user = options
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok());
        Self {
            options,
            user,
            scripts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SchedulerBackend for SlurmBackend {
    async fn submit(&self, request: &JobRequest) -> BackendResult<JobId> {
        tokio::fs::create_dir_all(&self.options.script_dir).await?;
        let script_path = self.options.script_dir.join(format!("{}.sh", request.name));
        tokio::fs::write(&script_path, script::render_slurm_script(request)).await?;
        self.scripts.lock().unwrap().push(script_path.clone());

        let output = Command::new(&self.options.sbatch)
            .arg(&script_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job = parse_sbatch(&stdout).ok_or_else(|| {
            BackendError::Rejected(format!("unexpected sbatch output: {}", stdout.trim()))
        })?;
        debug!(%job, script = %script_path.display(), "sbatch accepted");
        sleep(self.options.submit_delay).await;
        Ok(job)
    }

    async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>> {
        let mut cmd = Command::new(&self.options.squeue);
        if let Some(user) = &self.user {
            cmd.arg("-u").arg(user);
        }
        cmd.arg("-h").arg("-o").arg("%i %t %M %j");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(BackendError::Status(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(path) = &self.options.status_file {
            if let Err(e) = tokio::fs::write(path, stdout.as_bytes()).await {
                warn!(path = %path.display(), error = %e, "failed to mirror squeue output");
            }
        }
        let listed = parse_squeue(&stdout);
        Ok(jobs
            .iter()
            .filter_map(|job| listed.get(job).map(|status| (job.clone(), *status)))
            .collect())
    }

    async fn cancel(&self, job: &JobId) -> BackendResult<()> {
        let output = Command::new(&self.options.scancel)
            .arg(job.as_str())
            .output()
            .await?;
        if !output.status.success() {
            // scancel grumbles about jobs that already left the queue.
            debug!(
                %job,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "scancel reported failure"
            );
        }
        Ok(())
    }

    async fn cleanup(&self) -> BackendResult<()> {
        let scripts: Vec<PathBuf> = std::mem::take(&mut *self.scripts.lock().unwrap());
        for path in scripts {
            remove_quietly(&path).await;
        }
        if let Some(path) = &self.options.status_file {
            remove_quietly(path).await;
        }
        Ok(())
    }
}

/// The job id out of "Submitted batch job N".
fn parse_sbatch(output: &str) -> Option<JobId> {
    let token = output.split_whitespace().last()?;
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(JobId::new(token))
}

/// Headerless `squeue -h -o "%i %t %M %j"` lines into typed statuses.
/// A job listed under an unexpected state code still occupies the queue,
/// so it reads as pending.
fn parse_squeue(output: &str) -> HashMap<JobId, JobStatus> {
    let mut listed = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [id, state, elapsed, ..] = fields[..] else {
            continue;
        };
        let status = match state {
            "PD" => JobStatus::pending(),
            "R" => JobStatus::running(script::parse_dhms(elapsed)),
            "CG" => JobStatus::completing(),
            _ => JobStatus::pending(),
        };
        listed.insert(JobId::new(id), status);
    }
    listed
}
