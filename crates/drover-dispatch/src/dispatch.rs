//! Dispatch rounds — hand out work, fold results, tend the pool.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use drover_pool::WorkerPool;
use drover_wire::{Record, Reply, ReplyEndpoint, Request};

use crate::accumulate::{Accumulate, Collected, SumAccumulator};
use crate::error::DispatchResult;

/// What to tell an idle worker once the source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Workers stand by, backing off on their own, for a later round.
    #[default]
    Standby,
    /// Final round: idle workers are released for good.
    Done,
}

/// Dispatch tuning.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub exhausted: ExhaustedPolicy,
}

impl DispatchOptions {
    pub fn with_exhausted(mut self, policy: ExhaustedPolicy) -> Self {
        self.exhausted = policy;
        self
    }
}

/// Periodic pool upkeep a long round runs between message exchanges.
///
/// The pool stays exclusively borrowed for the round, so upkeep and
/// dispatch can never race each other.
pub struct Maintenance<'a> {
    pool: &'a mut WorkerPool,
    every: Duration,
    restart_fraction: Option<f64>,
}

impl<'a> Maintenance<'a> {
    pub fn new(pool: &'a mut WorkerPool, every: Duration) -> Self {
        Self {
            pool,
            every,
            restart_fraction: None,
        }
    }

    /// Also restart workers past this fraction of their walltime on each
    /// pass.
    pub fn with_restart_at(mut self, fraction: f64) -> Self {
        self.restart_fraction = Some(fraction);
        self
    }

    async fn run_once(&mut self) {
        let promoted = self.pool.promote_parked().await;
        if promoted > 0 {
            debug!(promoted, "maintenance promoted parked workers");
        }
        if let Some(fraction) = self.restart_fraction {
            let outcome = self.pool.restart_near_expiry(fraction).await;
            if !outcome.restarted.is_empty() || !outcome.parked.is_empty() {
                debug!(
                    restarted = outcome.restarted.len(),
                    parked = outcome.parked.len(),
                    "maintenance recycled near-expiry workers"
                );
            }
        }
    }
}

/// Runs dispatch rounds over an exclusively owned endpoint.
pub struct Dispatcher {
    endpoint: ReplyEndpoint,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(endpoint: ReplyEndpoint) -> Self {
        Self {
            endpoint,
            options: DispatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Address workers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Take the endpoint back, for example to run another round elsewhere.
    pub fn into_endpoint(self) -> ReplyEndpoint {
        self.endpoint
    }

    /// Hand out `items` and collect the declared `keys` from `n` results.
    pub async fn collect<I>(
        &mut self,
        keys: &[&str],
        n: usize,
        items: I,
        maintenance: Option<Maintenance<'_>>,
    ) -> DispatchResult<Collected>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut acc = Collected::new(keys);
        self.run_round(n, items.into_iter(), &mut acc, maintenance)
            .await?;
        Ok(acc)
    }

    /// Hand out `items` and reduce `result_key` tensors into a zeroed
    /// buffer of `shape` by addition, appending `control_key` values as
    /// they arrive. Shapes of rank deeper than three switch to the
    /// chunked slab variant.
    pub async fn sum<I>(
        &mut self,
        control_key: &str,
        result_key: &str,
        n: usize,
        items: I,
        shape: &[usize],
        maintenance: Option<Maintenance<'_>>,
    ) -> DispatchResult<SumAccumulator>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut acc = SumAccumulator::new(control_key, result_key, shape);
        self.run_round(n, items.into_iter(), &mut acc, maintenance)
            .await?;
        Ok(acc)
    }

    /// Answer every request arriving within `grace` of the previous one:
    /// `Done` to availability, `Ack` to stray results. Returns once the
    /// endpoint has stayed quiet for a full grace period. Used after a
    /// final round so surviving workers exit before the pool is torn
    /// down.
    pub async fn drain(&mut self, grace: Duration) {
        loop {
            match tokio::time::timeout(grace, self.endpoint.recv()).await {
                Ok(Ok((request, handle))) => {
                    let reply = match request {
                        Request::Available => Reply::Done,
                        Request::Result(_) => {
                            warn!("discarding a result that arrived after the round ended");
                            Reply::Ack
                        }
                    };
                    if let Err(e) = handle.reply(reply) {
                        warn!(error = %e, "failed to reply during drain");
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    /// The round loop: serve requests until the accumulator has taken `n`
    /// results. The only suspension point in steady state is the endpoint
    /// receive; the maintenance tick, when configured, interleaves between
    /// exchanges and never preempts one.
    async fn run_round<I, A>(
        &mut self,
        n: usize,
        mut items: I,
        acc: &mut A,
        mut maintenance: Option<Maintenance<'_>>,
    ) -> DispatchResult<()>
    where
        I: Iterator<Item = Record>,
        A: Accumulate,
    {
        let mut tick = maintenance.as_ref().map(|m| {
            let mut t = interval_at(Instant::now() + m.every, m.every);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        let mut handed_out: usize = 0;
        info!(expected = n, "dispatch round started");
        while acc.received() < n {
            let (request, handle) = match &mut tick {
                Some(t) => {
                    tokio::select! {
                        _ = t.tick() => {
                            if let Some(m) = maintenance.as_mut() {
                                m.run_once().await;
                            }
                            continue;
                        }
                        incoming = self.endpoint.recv() => incoming?,
                    }
                }
                None => self.endpoint.recv().await?,
            };
            match request {
                Request::Available => match items.next() {
                    Some(item) => {
                        handed_out += 1;
                        debug!(handed_out, "work item handed out");
                        if let Err(e) = handle.reply(Reply::Work(item)) {
                            // The item is gone with the connection; the
                            // round cannot finish and the caller restarts.
                            warn!(error = %e, "failed to send work item");
                        }
                    }
                    None => {
                        let reply = match self.options.exhausted {
                            ExhaustedPolicy::Standby => Reply::Standby,
                            ExhaustedPolicy::Done => Reply::Done,
                        };
                        if let Err(e) = handle.reply(reply) {
                            warn!(error = %e, "failed to send idle reply");
                        }
                    }
                },
                Request::Result(record) => {
                    match acc.fold(&record) {
                        Ok(()) => {
                            debug!(received = acc.received(), expected = n, "result folded");
                        }
                        Err(e) => warn!(error = %e, "dropping malformed result"),
                    }
                    // Ack either way so the worker's alternation survives.
                    if let Err(e) = handle.reply(Reply::Ack) {
                        warn!(error = %e, "failed to ack result");
                    }
                }
            }
        }
        info!(received = acc.received(), handed_out, "dispatch round finished");
        Ok(())
    }
}
