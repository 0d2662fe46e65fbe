//! PBS/Torque driver — qsub submission, bulk qstat polling, qdel.
//!
//! PBS has no host-exclusion directive, so this driver carries its own
//! node inventory and pins each job to the next eligible host in a
//! round-robin rotation. An empty inventory falls back to letting the
//! scheduler place jobs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use drover_pool::{BackendError, BackendResult, JobId, JobRequest, JobStatus, SchedulerBackend};

use crate::hosts::HostRotation;
use crate::{remove_quietly, script};

/// Tuning for [`PbsBackend`].
#[derive(Debug, Clone)]
pub struct PbsOptions {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    /// User whose queue to poll; defaults to `$USER` at construction.
    pub user: Option<String>,
    /// Where rendered batch scripts are written.
    pub script_dir: PathBuf,
    /// Mirror raw qstat output here on every poll.
    pub status_file: Option<PathBuf>,
    /// Node inventory jobs are pinned to, round-robin. Empty means no
    /// pinning.
    pub nodes: Vec<String>,
    /// Pause after each accepted submission.
    pub submit_delay: Duration,
}

impl Default for PbsOptions {
    fn default() -> Self {
        Self {
            qsub: "qsub".into(),
            qstat: "qstat".into(),
            qdel: "qdel".into(),
            user: None,
            script_dir: PathBuf::from("."),
            status_file: None,
            nodes: Vec::new(),
            submit_delay: Duration::from_millis(500),
        }
    }
}

impl PbsOptions {
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

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }
}

/// Drives a PBS/Torque cluster. Jobs are identified by the numeric part
/// of the id qsub prints ("1234.server" becomes "1234").
pub struct PbsBackend {
    options: PbsOptions,
    user: Option<String>,
    rotation: HostRotation,
    scripts: Mutex<Vec<PathBuf>>,
}

impl PbsBackend {
    pub fn new(options: PbsOptions) -> Self {
        let user = options
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok());
        let rotation = HostRotation::new(options.nodes.iter().cloned());
        Self {
            options,
            user,
            rotation,
            scripts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SchedulerBackend for PbsBackend {
    async fn submit(&self, request: &JobRequest) -> BackendResult<JobId> {
        let host = if self.rotation.is_empty() {
            None
        } else {
            let picked = self
                .rotation
                .next_eligible(&request.resources.exclude)
                .ok_or_else(|| {
                    BackendError::Rejected("every inventory host is excluded".into())
                })?;
            Some(picked)
        };

        tokio::fs::create_dir_all(&self.options.script_dir).await?;
        let script_path = self.options.script_dir.join(format!("{}.sh", request.name));
        let body = script::render_pbs_script(request, host.as_deref());
        tokio::fs::write(&script_path, body).await?;
        self.scripts.lock().unwrap().push(script_path.clone());

        let output = Command::new(&self.options.qsub)
            .arg(&script_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job = parse_qsub(&stdout).ok_or_else(|| {
            BackendError::Rejected(format!("unexpected qsub output: {}", stdout.trim()))
        })?;
        debug!(%job, host = host.as_deref().unwrap_or("any"), "qsub accepted");
        sleep(self.options.submit_delay).await;
        Ok(job)
    }

    async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>> {
        let mut cmd = Command::new(&self.options.qstat);
        if let Some(user) = &self.user {
            cmd.arg("-u").arg(user);
        }
        cmd.arg("-n").arg("-1");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(BackendError::Status(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(path) = &self.options.status_file {
            if let Err(e) = tokio::fs::write(path, stdout.as_bytes()).await {
                warn!(path = %path.display(), error = %e, "failed to mirror qstat output");
            }
        }
        let listed = parse_qstat(&stdout);
        Ok(jobs
            .iter()
            .filter_map(|job| listed.get(job).map(|status| (job.clone(), *status)))
            .collect())
    }

    async fn cancel(&self, job: &JobId) -> BackendResult<()> {
        let output = Command::new(&self.options.qdel)
            .arg(job.as_str())
            .output()
            .await?;
        if !output.status.success() {
            // qdel complains about jobs that already finished.
            debug!(
                %job,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "qdel reported failure"
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

/// The numeric job id out of qsub's "1234.server" line.
fn parse_qsub(output: &str) -> Option<JobId> {
    let token = output.split_whitespace().last()?;
    let id = token.split('.').next()?;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(JobId::new(id))
}

/// `qstat -n -1` rows into typed statuses. Data rows start with a digit
/// and carry at least eleven whitespace-separated fields; the state code
/// sits at index 9 and the elapsed clock at index 10.
fn parse_qstat(output: &str) -> HashMap<JobId, JobStatus> {
    let mut listed = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 {
            continue;
        }
        if !fields[0].starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let id = fields[0].split('.').next().unwrap_or(fields[0]);
        let status = match fields[9] {
            "Q" | "H" | "W" | "T" => JobStatus::pending(),
            "R" => JobStatus::running(script::parse_hhmm(fields[10])),
            "E" | "C" => JobStatus::completing(),
            _ => JobStatus::pending(),
        };
        listed.insert(JobId::new(id), status);
    }
    listed
}
