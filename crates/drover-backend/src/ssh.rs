//! SSH driver — workers on plain hosts with no queueing system.
//!
//! Launches run under nohup with the shell echoing back the pid, so a
//! job id is "host:pid". Status is a per-host `ps` for exactly the
//! tracked pids: a worker either runs or is gone, there is no pending
//! state. An ssh transport failure (exit 255) fails the whole query
//! rather than letting unreachable hosts masquerade as dead workers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use drover_pool::{BackendError, BackendResult, JobId, JobRequest, JobStatus, SchedulerBackend};

use crate::hosts::HostRotation;

/// Tuning for [`SshBackend`].
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh: String,
    /// Hosts to rotate launches over.
    pub hosts: Vec<String>,
    /// ConnectTimeout handed to ssh.
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh: "ssh".into(),
            hosts: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshOptions {
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Drives workers over bare ssh. Resource limits in the job request are
/// not enforceable here; only the exclusion list and the walltime the
/// pool tracks on its side apply.
pub struct SshBackend {
    options: SshOptions,
    rotation: HostRotation,
}

impl SshBackend {
    pub fn new(options: SshOptions) -> Self {
        let rotation = HostRotation::new(options.hosts.iter().cloned());
        Self { options, rotation }
    }

    fn ssh(&self, host: &str) -> Command {
        let mut cmd = Command::new(&self.options.ssh);
        cmd.arg("-n")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg(host);
        cmd
    }
}

#[async_trait]
impl SchedulerBackend for SshBackend {
    async fn submit(&self, request: &JobRequest) -> BackendResult<JobId> {
        let host = self
            .rotation
            .next_eligible(&request.resources.exclude)
            .ok_or_else(|| BackendError::Rejected("no eligible host to launch on".into()))?;
        let remote = format!(
            "nohup {} > {} 2> {} < /dev/null & echo $!",
            request.command,
            request.stdout_log.display(),
            request.stderr_log.display()
        );
        let output = self.ssh(&host).arg(remote).output().await?;
        if !output.status.success() {
            return Err(BackendError::Rejected(format!(
                "launch on {host} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid: u32 = stdout.trim().parse().map_err(|_| {
            BackendError::Rejected(format!(
                "no pid in remote shell output: {:?}",
                stdout.trim()
            ))
        })?;
        debug!(host = %host, pid, "worker launched");
        Ok(JobId::new(format!("{host}:{pid}")))
    }

    async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>> {
        let mut by_host: HashMap<&str, Vec<(&JobId, u32)>> = HashMap::new();
        for job in jobs {
            let Some((host, pid)) = split_job(job) else {
                warn!(%job, "job id does not look like host:pid");
                continue;
            };
            by_host.entry(host).or_default().push((job, pid));
        }

        let mut statuses = HashMap::new();
        for (host, tracked) in by_host {
            let pid_list = tracked
                .iter()
                .map(|(_, pid)| pid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let output = self
                .ssh(host)
                .arg(format!("ps -o pid=,etimes= -p {pid_list}"))
                .output()
                .await?;
            // ps exits nonzero when some pids are gone; only a transport
            // failure means the answer is unusable.
            if output.status.code() == Some(255) {
                return Err(BackendError::Status(format!(
                    "ssh to {host} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let alive = parse_ps(&String::from_utf8_lossy(&output.stdout));
            for (job, pid) in tracked {
                if let Some(elapsed) = alive.get(&pid) {
                    statuses.insert(job.clone(), JobStatus::running(Some(*elapsed)));
                }
            }
        }
        Ok(statuses)
    }

    async fn cancel(&self, job: &JobId) -> BackendResult<()> {
        let Some((host, pid)) = split_job(job) else {
            return Err(BackendError::Cancel(format!(
                "job id does not look like host:pid: {job}"
            )));
        };
        let output = self.ssh(host).arg(format!("kill {pid}")).output().await?;
        if output.status.code() == Some(255) {
            return Err(BackendError::Cancel(format!(
                "ssh to {host} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !output.status.success() {
            debug!(%job, "kill reported failure, process already gone");
        }
        Ok(())
    }
}

/// Split "host:pid", tolerating hosts that themselves contain colons.
fn split_job(job: &JobId) -> Option<(&str, u32)> {
    let (host, pid) = job.as_str().rsplit_once(':')?;
    Some((host, pid.parse().ok()?))
}

/// `ps -o pid=,etimes=` rows into pid -> elapsed.
fn parse_ps(output: &str) -> HashMap<u32, Duration> {
    let mut alive = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(etimes)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(pid), Ok(secs)) = (pid.parse::<u32>(), etimes.parse::<u64>()) else {
            continue;
        };
        alive.insert(pid, Duration::from_secs(secs));
    }
    alive
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_pool::ResourceSpec;

    #[test]
    fn job_ids_split_into_host_and_pid() {
        assert_eq!(split_job(&JobId::new("rcf101:4242")), Some(("rcf101", 4242)));
        assert_eq!(split_job(&JobId::new("fe80::1:4242")), Some(("fe80::1", 4242)));
        assert_eq!(split_job(&JobId::new("rcf101")), None);
        assert_eq!(split_job(&JobId::new("rcf101:notapid")), None);
    }

    #[test]
    fn ps_rows_parse_to_elapsed_seconds() {
        let alive = parse_ps("   4242     120\n    977       5\n");
        assert_eq!(alive.len(), 2);
        assert_eq!(alive[&4242], Duration::from_secs(120));
        assert_eq!(alive[&977], Duration::from_secs(5));
        assert!(parse_ps("").is_empty());
    }

    #[tokio::test]
    async fn exhausted_inventory_rejects_without_touching_the_network() {
        let backend = SshBackend::new(SshOptions::default().with_hosts(["node1"]));
        let request = JobRequest {
            name: "worker-00test-001".into(),
            command: "drover-worker".into(),
            resources: ResourceSpec::new(1, 1, Duration::from_secs(60), "any")
                .with_exclude(vec!["node1".into()]),
            stdout_log: "/tmp/out.log".into(),
            stderr_log: "/tmp/err.log".into(),
        };
        let err = backend.submit(&request).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn status_of_nothing_asks_nobody() {
        let backend = SshBackend::new(SshOptions::default().with_hosts(["node1"]));
        let statuses = backend.status(&[]).await.unwrap();
        assert!(statuses.is_empty());
    }
}
