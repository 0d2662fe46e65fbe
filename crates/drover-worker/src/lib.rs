//! drover-worker — the loop a remote worker process runs.
//!
//! Connects back to the coordinator, announces availability, pushes each
//! received work item through a caller-supplied compute function, and
//! submits the result. A `Standby` reply backs the worker off
//! exponentially (reset on the next work item); `Done` ends the loop
//! cleanly. A failing compute function stops the worker instead of
//! inventing a result, which the pool manager later observes as a
//! vanished job.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use drover_wire::{Record, Reply, Request, RequestEndpoint, WireOptions};

/// Result type alias for the worker loop.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that stop the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Wire(#[from] drover_wire::WireError),

    #[error("compute function failed: {0}")]
    Compute(#[source] anyhow::Error),

    #[error("compute task panicked")]
    ComputePanicked,
}

/// Backoff and connection tuning for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub wire: WireOptions,
    /// First pause after a Standby reply.
    pub backoff_initial: Duration,
    /// Ceiling the pause grows toward.
    pub backoff_max: Duration,
    /// Growth factor per consecutive Standby.
    pub backoff_multiplier: f64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            wire: WireOptions::default(),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl WorkerOptions {
    pub fn with_wire(mut self, wire: WireOptions) -> Self {
        self.wire = wire;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self.backoff_multiplier = multiplier;
        self
    }
}

/// Counters the loop hands back once the coordinator releases it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Work items processed and acknowledged.
    pub processed: usize,
    /// Standby replies received.
    pub standbys: usize,
}

/// Connect to the coordinator and serve until it sends `Done`.
///
/// The compute function runs on the blocking thread pool, so it may do
/// heavy numerical work without starving the connection.
pub async fn run<A, F>(addr: A, options: WorkerOptions, compute: F) -> WorkerResult<WorkerReport>
where
    A: ToSocketAddrs,
    F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
{
    let mut endpoint = RequestEndpoint::connect(addr, options.wire.clone()).await?;
    serve(&mut endpoint, options, compute).await
}

/// The same loop over an endpoint the caller already connected.
pub async fn serve<F>(
    endpoint: &mut RequestEndpoint,
    options: WorkerOptions,
    compute: F,
) -> WorkerResult<WorkerReport>
where
    F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
{
    let compute = Arc::new(compute);
    let mut report = WorkerReport::default();
    let mut backoff = options.backoff_initial;
    info!("worker attached");
    loop {
        match endpoint.request(&Request::Available).await? {
            Reply::Work(item) => {
                backoff = options.backoff_initial;
                let f = Arc::clone(&compute);
                let result = tokio::task::spawn_blocking(move || f(item))
                    .await
                    .map_err(|_| WorkerError::ComputePanicked)?
                    .map_err(WorkerError::Compute)?;
                match endpoint.request(&Request::Result(result)).await? {
                    Reply::Ack => {
                        report.processed += 1;
                        debug!(processed = report.processed, "result acknowledged");
                    }
                    other => warn!(reply = ?other, "unexpected reply to a result"),
                }
            }
            Reply::Standby => {
                report.standbys += 1;
                debug!(pause = ?backoff, "standing by");
                sleep(backoff).await;
                backoff = next_backoff(backoff, &options);
            }
            Reply::Done => {
                info!(processed = report.processed, "released by coordinator");
                return Ok(report);
            }
            Reply::Ack => warn!("unexpected ack to an availability request"),
        }
    }
}

fn next_backoff(current: Duration, options: &WorkerOptions) -> Duration {
    let scaled = current.as_secs_f64() * options.backoff_multiplier;
    Duration::from_secs_f64(scaled.min(options.backoff_max.as_secs_f64()))
}
