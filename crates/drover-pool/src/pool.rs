//! Worker pool manager — desired-state reconciliation over a scheduler.
//!
//! The pool tracks the workers it wants and periodically reconciles them
//! against what the scheduler actually reports. Growth follows one of
//! three policies; restart-before-expiry keeps long computations supplied
//! with fresh workers; and a worker the scheduler has forgotten is retired
//! as Terminated (after it ran) or Faulty (it never appeared in three
//! consecutive polls).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::{JobId, JobRequest, JobState, JobStatus, SchedulerBackend};
use crate::error::{PoolError, PoolResult};
use crate::options::PoolOptions;
use crate::worker::{IdGenerator, ResourceSpec, Worker, WorkerId, WorkerState};

/// Consecutive polls a submitted worker may go missing before it is
/// declared faulty.
const MISSED_POLL_LIMIT: u32 = 3;

/// How a growth call approaches the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Submit everything immediately, then poll for a bounded window.
    Plain,
    /// Submit one at a time and park the remainder as soon as the queue
    /// shows congestion (two submissions Pending simultaneously).
    Adaptive,
    /// Overshoot a contended queue: submit the missing count each round
    /// and discard what stays Pending, until the target is Running.
    Busy,
}

/// What a restart-before-expiry pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartOutcome {
    /// Workers cancelled and immediately resubmitted.
    pub restarted: Vec<WorkerId>,
    /// Workers cancelled and parked for a later promotion pass.
    pub parked: Vec<WorkerId>,
}

/// Manages a herd of batch-scheduler workers toward a desired count.
///
/// Single-owner type: every operation takes `&mut self`, and the only
/// concurrency involved is the backend's own.
pub struct WorkerPool {
    backend: Arc<dyn SchedulerBackend>,
    command: String,
    log_dir: PathBuf,
    options: PoolOptions,
    ids: IdGenerator,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Create an empty pool that launches workers with the given command.
    pub fn new(
        backend: Arc<dyn SchedulerBackend>,
        command: impl Into<String>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            command: command.into(),
            log_dir: log_dir.into(),
            options: PoolOptions::default(),
            ids: IdGenerator::new(),
            workers: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn running_count(&self) -> usize {
        self.count_state(WorkerState::Running)
    }

    pub fn pending_count(&self) -> usize {
        self.count_state(WorkerState::Pending)
    }

    pub fn parked_count(&self) -> usize {
        self.count_state(WorkerState::ToSubmit)
    }

    fn count_state(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    /// Workers holding a slot toward a growth target: everything that is
    /// not terminal, parked workers included.
    fn occupied_slots(&self) -> usize {
        self.workers.iter().filter(|w| !w.state.is_terminal()).count()
    }

    /// Grow the pool toward `n` live workers under the given policy.
    ///
    /// Returns the number observed Running when the call finished. Growth
    /// is bounded by `poll_attempts`; a rejected submission costs its slot
    /// and degrades the achieved count rather than failing the call.
    pub async fn grow(&mut self, n: usize, spec: &ResourceSpec, policy: GrowthPolicy) -> usize {
        match policy {
            GrowthPolicy::Plain => self.grow_plain(n, spec).await,
            GrowthPolicy::Adaptive => self.grow_adaptive(n, spec).await,
            GrowthPolicy::Busy => self.grow_busy(n, spec).await,
        }
    }

    async fn grow_plain(&mut self, n: usize, spec: &ResourceSpec) -> usize {
        let missing = n.saturating_sub(self.occupied_slots());
        for _ in 0..missing {
            self.spawn_worker(spec).await;
        }
        for _ in 0..self.options.poll_attempts {
            if self.running_count() >= n {
                break;
            }
            sleep(self.options.poll_interval).await;
            if let Err(e) = self.refresh_states(None).await {
                warn!(error = %e, "state refresh failed while growing");
            }
        }
        let running = self.running_count();
        info!(target = n, running, "plain growth finished");
        running
    }

    async fn grow_adaptive(&mut self, n: usize, spec: &ResourceSpec) -> usize {
        // Workers parked by an earlier call get the first shot.
        self.promote_parked().await;
        let mut rejections = 0;
        while self.occupied_slots() < n {
            if let Err(e) = self.refresh_states(None).await {
                warn!(error = %e, "state refresh failed while growing");
            }
            if self.pending_count() >= self.options.pending_limit {
                let parked = n - self.occupied_slots();
                for _ in 0..parked {
                    let id = self.ids.next_id();
                    let mut worker = Worker::new(id, spec.clone(), &self.log_dir);
                    worker.state = WorkerState::ToSubmit;
                    self.workers.push(worker);
                }
                info!(parked, "queue congested, parked remaining workers");
                break;
            }
            // Rejections burn the poll budget rather than spinning the loop.
            if self.spawn_worker(spec).await.is_none() {
                rejections += 1;
                if rejections >= self.options.poll_attempts {
                    warn!(rejections, "adaptive growth stopped after repeated rejections");
                    break;
                }
                sleep(self.options.poll_interval).await;
            }
        }
        if let Err(e) = self.refresh_states(None).await {
            warn!(error = %e, "state refresh failed while growing");
        }
        let running = self.running_count();
        info!(
            target = n,
            running,
            parked = self.parked_count(),
            "adaptive growth finished"
        );
        running
    }

    async fn grow_busy(&mut self, n: usize, spec: &ResourceSpec) -> usize {
        for _ in 0..self.options.poll_attempts {
            if let Err(e) = self.refresh_states(None).await {
                warn!(error = %e, "state refresh failed while growing");
            }
            if self.running_count() >= n {
                break;
            }
            let missing = n - self.running_count();
            let mut round: Vec<WorkerId> = Vec::with_capacity(missing);
            for _ in 0..missing {
                if let Some(idx) = self.spawn_worker(spec).await {
                    round.push(self.workers[idx].id.clone());
                }
            }
            sleep(self.options.poll_interval).await;
            if let Err(e) = self.refresh_states(None).await {
                warn!(error = %e, "state refresh failed while growing");
            }
            // This round's submissions either started or get discarded.
            let mut discarded = 0;
            for id in &round {
                let Some(idx) = self.workers.iter().position(|w| w.id == *id) else {
                    continue;
                };
                if self.workers[idx].state != WorkerState::Pending {
                    continue;
                }
                if let Some(job) = self.workers[idx].job.clone() {
                    if let Err(e) = self.backend.cancel(&job).await {
                        debug!(%job, error = %e, "cancel of discarded submission failed");
                    }
                }
                self.workers.remove(idx);
                discarded += 1;
            }
            if discarded > 0 {
                debug!(discarded, "discarded submissions still pending after the poll window");
            }
            if self.running_count() >= n {
                break;
            }
        }
        let running = self.running_count();
        info!(target = n, running, "busy growth finished");
        running
    }

    /// Submit parked workers, subject to the same congestion throttle the
    /// adaptive policy applies. Returns how many were promoted.
    pub async fn promote_parked(&mut self) -> usize {
        if self.parked_count() == 0 {
            return 0;
        }
        if let Err(e) = self.refresh_states(None).await {
            warn!(error = %e, "state refresh failed before promotion");
        }
        let mut promoted = 0;
        loop {
            if self.pending_count() >= self.options.pending_limit {
                break;
            }
            let Some(idx) = self
                .workers
                .iter()
                .position(|w| w.state == WorkerState::ToSubmit)
            else {
                break;
            };
            match self.submit_worker(idx).await {
                Ok(()) => promoted += 1,
                Err(e) => {
                    // Stays parked; a later pass retries.
                    warn!(error = %e, "failed to promote parked worker");
                    break;
                }
            }
        }
        if promoted > 0 {
            info!(promoted, "promoted parked workers");
        }
        promoted
    }

    /// Cancel and resubmit workers whose observed runtime has crossed
    /// `fraction` of their walltime.
    ///
    /// Resubmission uses the identical resource spec the worker was
    /// created with. Workers that would push the simultaneous Pending
    /// count past the cap are parked instead and picked up by a later
    /// promotion pass.
    pub async fn restart_near_expiry(&mut self, fraction: f64) -> RestartOutcome {
        let mut outcome = RestartOutcome::default();
        if let Err(e) = self.refresh_states(None).await {
            warn!(error = %e, "state refresh failed before restart pass");
        }
        let candidates: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state == WorkerState::Running)
            .filter(|(_, w)| match w.last_elapsed {
                Some(elapsed) => {
                    elapsed.as_secs_f64() >= w.resources.walltime.as_secs_f64() * fraction
                }
                None => false,
            })
            .map(|(i, _)| i)
            .collect();
        for idx in candidates {
            let id = self.workers[idx].id.clone();
            if let Some(job) = self.workers[idx].job.take() {
                if let Err(e) = self.backend.cancel(&job).await {
                    warn!(worker = %id, error = %e, "cancel before restart failed");
                }
            }
            self.workers[idx].state = WorkerState::ToSubmit;
            self.workers[idx].last_elapsed = None;
            self.workers[idx].missed_polls = 0;
            if self.pending_count() < self.options.restart_pending_cap {
                match self.submit_worker(idx).await {
                    Ok(()) => {
                        info!(worker = %id, "worker restarted before expiry");
                        outcome.restarted.push(id);
                    }
                    Err(e) => {
                        warn!(error = %e, "restart submission failed, leaving worker parked");
                        outcome.parked.push(id);
                    }
                }
            } else {
                debug!(worker = %id, "restart deferred, pending cap reached");
                outcome.parked.push(id);
            }
        }
        outcome
    }

    /// Shrink the collection to `desired` workers, preferring live ones
    /// and backfilling from parked. Reshapes bookkeeping only; nothing is
    /// submitted or cancelled.
    pub fn trim(&mut self, desired: usize) {
        if self.workers.len() <= desired {
            return;
        }
        let mut kept: Vec<Worker> = Vec::with_capacity(desired);
        let mut rest: Vec<Worker> = Vec::new();
        for w in self.workers.drain(..) {
            if kept.len() < desired
                && matches!(w.state, WorkerState::Running | WorkerState::Pending)
            {
                kept.push(w);
            } else {
                rest.push(w);
            }
        }
        if kept.len() < desired {
            let mut leftover = Vec::new();
            for w in rest {
                if kept.len() < desired && w.state == WorkerState::ToSubmit {
                    kept.push(w);
                } else {
                    leftover.push(w);
                }
            }
            rest = leftover;
        }
        for w in &rest {
            if w.state.is_submitted() {
                warn!(worker = %w.id, state = ?w.state, "dropping live worker without cancelling its job");
            }
        }
        info!(kept = kept.len(), dropped = rest.len(), "trimmed pool");
        self.workers = kept;
    }

    /// Refresh every worker against the scheduler and return the states
    /// in pool order.
    pub async fn poll_states(&mut self) -> Vec<WorkerState> {
        if let Err(e) = self.refresh_states(None).await {
            warn!(error = %e, "status refresh failed");
        }
        self.workers.iter().map(|w| w.state).collect()
    }

    /// Refresh and return the states of the given workers only.
    pub async fn status_of(&mut self, ids: &[WorkerId]) -> PoolResult<Vec<WorkerState>> {
        let mut indices = Vec::with_capacity(ids.len());
        for id in ids {
            let idx = self
                .workers
                .iter()
                .position(|w| w.id == *id)
                .ok_or_else(|| PoolError::WorkerNotFound(id.clone()))?;
            indices.push(idx);
        }
        if let Err(e) = self.refresh_states(Some(&indices)).await {
            warn!(error = %e, "status refresh failed");
        }
        Ok(indices.into_iter().map(|i| self.workers[i].state).collect())
    }

    /// Cancel every worker still holding a scheduler job and mark the
    /// pool terminated. With `clean`, worker log files and the backend's
    /// transient artifacts are removed as well.
    pub async fn shutdown(&mut self, clean: bool) {
        for idx in 0..self.workers.len() {
            let job = self.workers[idx].job.take();
            if let Some(job) = job {
                if let Err(e) = self.backend.cancel(&job).await {
                    debug!(%job, error = %e, "cancel during shutdown failed");
                }
            }
            let w = &mut self.workers[idx];
            if !w.state.is_terminal() {
                w.state = WorkerState::Terminated;
            }
        }
        if clean {
            for w in &self.workers {
                for path in [w.stdout_log(), w.stderr_log()] {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "failed to remove worker log")
                        }
                    }
                }
            }
            if let Err(e) = self.backend.cleanup().await {
                debug!(error = %e, "backend cleanup failed");
            }
        }
        info!(workers = self.workers.len(), clean, "pool shut down");
    }

    /// Create a worker and submit it. A rejected submission abandons the
    /// slot and degrades the achieved count.
    async fn spawn_worker(&mut self, spec: &ResourceSpec) -> Option<usize> {
        let id = self.ids.next_id();
        let worker = Worker::new(id, spec.clone(), &self.log_dir);
        self.workers.push(worker);
        let idx = self.workers.len() - 1;
        match self.submit_worker(idx).await {
            Ok(()) => Some(idx),
            Err(e) => {
                warn!(error = %e, "abandoning worker slot after failed submission");
                self.workers.remove(idx);
                None
            }
        }
    }

    async fn submit_worker(&mut self, idx: usize) -> PoolResult<()> {
        let worker = &self.workers[idx];
        let request = JobRequest {
            name: worker.id.to_string(),
            command: self.command.clone(),
            resources: worker.resources.clone(),
            stdout_log: worker.stdout_log.clone(),
            stderr_log: worker.stderr_log.clone(),
        };
        match self.backend.submit(&request).await {
            Ok(job) => {
                let worker = &mut self.workers[idx];
                info!(worker = %worker.id, %job, "worker submitted");
                worker.job = Some(job);
                worker.state = WorkerState::Pending;
                worker.submissions += 1;
                worker.missed_polls = 0;
                Ok(())
            }
            Err(source) => Err(PoolError::Submission {
                worker: self.workers[idx].id.clone(),
                source,
            }),
        }
    }

    /// One bulk status query, reconciled into per-worker states.
    ///
    /// A failed query is retried once; failing twice counts a missed poll
    /// against every queried worker, the same as an individual
    /// disappearance would.
    async fn refresh_states(&mut self, subset: Option<&[usize]>) -> PoolResult<()> {
        let indices: Vec<usize> = match subset {
            Some(s) => s
                .iter()
                .copied()
                .filter(|&i| self.workers[i].state.is_submitted())
                .collect(),
            None => self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.state.is_submitted())
                .map(|(i, _)| i)
                .collect(),
        };
        if indices.is_empty() {
            return Ok(());
        }
        let jobs: Vec<JobId> = indices
            .iter()
            .filter_map(|&i| self.workers[i].job.clone())
            .collect();
        let statuses = match self.backend.status(&jobs).await {
            Ok(s) => s,
            Err(first) => {
                debug!(error = %first, "status query failed, retrying once");
                match self.backend.status(&jobs).await {
                    Ok(s) => s,
                    Err(second) => {
                        for &i in &indices {
                            self.count_missed_poll(i);
                        }
                        return Err(PoolError::StatusQuery(second));
                    }
                }
            }
        };
        for &i in &indices {
            let Some(job) = self.workers[i].job.clone() else {
                continue;
            };
            let status = statuses
                .get(&job)
                .copied()
                .unwrap_or_else(JobStatus::not_found);
            self.apply_status(i, status);
        }
        Ok(())
    }

    fn apply_status(&mut self, idx: usize, status: JobStatus) {
        match status.state {
            JobState::Pending => {
                let w = &mut self.workers[idx];
                w.state = WorkerState::Pending;
                w.missed_polls = 0;
            }
            JobState::Running => {
                let w = &mut self.workers[idx];
                if w.state != WorkerState::Running {
                    info!(worker = %w.id, "worker running");
                }
                w.state = WorkerState::Running;
                w.missed_polls = 0;
                if status.elapsed.is_some() {
                    w.last_elapsed = status.elapsed;
                }
            }
            JobState::Completing => {
                let w = &mut self.workers[idx];
                w.state = WorkerState::Completing;
                w.missed_polls = 0;
            }
            JobState::NotFound => match self.workers[idx].state {
                // A worker that was seen running has simply finished.
                WorkerState::Running | WorkerState::Completing => {
                    let w = &mut self.workers[idx];
                    info!(worker = %w.id, "worker terminated");
                    w.state = WorkerState::Terminated;
                    w.job = None;
                }
                _ => self.count_missed_poll(idx),
            },
        }
    }

    fn count_missed_poll(&mut self, idx: usize) {
        let w = &mut self.workers[idx];
        w.missed_polls += 1;
        if w.missed_polls >= MISSED_POLL_LIMIT && w.state != WorkerState::Faulty {
            warn!(worker = %w.id, misses = w.missed_polls, "worker presumed faulty");
            w.state = WorkerState::Faulty;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendError, BackendResult};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum StubMode {
        /// Submissions run immediately.
        Instant,
        /// Submissions never leave the queue.
        Stuck,
        /// Submissions with this ordinal or later run immediately,
        /// earlier ones never leave the queue.
        RunFromSubmission(usize),
        /// Submissions with this ordinal or later never leave the queue,
        /// earlier ones keep running.
        StuckFromSubmission(usize),
    }

    struct StubJob {
        ordinal: usize,
    }

    struct StubState {
        mode: StubMode,
        next_job: usize,
        jobs: HashMap<JobId, StubJob>,
        submitted: Vec<JobRequest>,
        submit_attempts: usize,
        cancelled: Vec<JobId>,
        vanished: HashSet<JobId>,
        elapsed: Option<Duration>,
        fail_submits: bool,
        fail_status_calls: u32,
        cleaned: bool,
    }

    struct StubBackend {
        state: Mutex<StubState>,
    }

    impl StubBackend {
        fn new(mode: StubMode) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(StubState {
                    mode,
                    next_job: 0,
                    jobs: HashMap::new(),
                    submitted: Vec::new(),
                    submit_attempts: 0,
                    cancelled: Vec::new(),
                    vanished: HashSet::new(),
                    elapsed: None,
                    fail_submits: false,
                    fail_status_calls: 0,
                    cleaned: false,
                }),
            })
        }

        fn set_mode(&self, mode: StubMode) {
            self.state.lock().unwrap().mode = mode;
        }

        fn set_elapsed(&self, elapsed: Duration) {
            self.state.lock().unwrap().elapsed = Some(elapsed);
        }

        fn vanish_all(&self) {
            let mut st = self.state.lock().unwrap();
            let jobs: Vec<JobId> = st.jobs.keys().cloned().collect();
            st.vanished.extend(jobs);
        }

        fn fail_submits(&self) {
            self.state.lock().unwrap().fail_submits = true;
        }

        fn fail_next_status(&self, calls: u32) {
            self.state.lock().unwrap().fail_status_calls = calls;
        }

        fn submitted(&self) -> Vec<JobRequest> {
            self.state.lock().unwrap().submitted.clone()
        }

        fn submit_attempts(&self) -> usize {
            self.state.lock().unwrap().submit_attempts
        }

        fn cancelled(&self) -> Vec<JobId> {
            self.state.lock().unwrap().cancelled.clone()
        }

        fn cleaned(&self) -> bool {
            self.state.lock().unwrap().cleaned
        }
    }

    #[async_trait]
    impl SchedulerBackend for StubBackend {
        async fn submit(&self, request: &JobRequest) -> BackendResult<JobId> {
            let mut st = self.state.lock().unwrap();
            st.submit_attempts += 1;
            if st.fail_submits {
                return Err(BackendError::Rejected("stub rejects everything".into()));
            }
            let ordinal = st.submitted.len();
            st.submitted.push(request.clone());
            let job = JobId::new(format!("job-{}", st.next_job));
            st.next_job += 1;
            st.jobs.insert(job.clone(), StubJob { ordinal });
            Ok(job)
        }

        async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>> {
            let mut st = self.state.lock().unwrap();
            if st.fail_status_calls > 0 {
                st.fail_status_calls -= 1;
                return Err(BackendError::Status("stub outage".into()));
            }
            let mut out = HashMap::new();
            for job in jobs {
                if st.vanished.contains(job) {
                    continue;
                }
                let Some(entry) = st.jobs.get(job) else {
                    continue;
                };
                let runs = match st.mode {
                    StubMode::Instant => true,
                    StubMode::Stuck => false,
                    StubMode::RunFromSubmission(k) => entry.ordinal >= k,
                    StubMode::StuckFromSubmission(k) => entry.ordinal < k,
                };
                let status = if runs {
                    JobStatus::running(st.elapsed)
                } else {
                    JobStatus::pending()
                };
                out.insert(job.clone(), status);
            }
            Ok(out)
        }

        async fn cancel(&self, job: &JobId) -> BackendResult<()> {
            let mut st = self.state.lock().unwrap();
            st.cancelled.push(job.clone());
            st.jobs.remove(job);
            Ok(())
        }

        async fn cleanup(&self) -> BackendResult<()> {
            self.state.lock().unwrap().cleaned = true;
            Ok(())
        }
    }

    fn test_spec() -> ResourceSpec {
        ResourceSpec::new(2, 8, Duration::from_secs(3600), "batch")
    }

    fn quick_options() -> PoolOptions {
        PoolOptions::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_poll_attempts(3)
    }

    fn test_pool(stub: Arc<StubBackend>) -> WorkerPool {
        WorkerPool::new(stub, "drover-worker --attach", "/tmp/drover-test-logs")
            .with_options(quick_options())
    }

    #[tokio::test(start_paused = true)]
    async fn plain_growth_reaches_target() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(4, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(achieved, 4);
        assert_eq!(pool.len(), 4);
        assert!(
            pool.workers()
                .iter()
                .all(|w| w.state() == WorkerState::Running)
        );
        assert_eq!(stub.submitted().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_growth_is_bounded_on_a_stuck_queue() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(2, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(achieved, 0);
        assert_eq!(stub.submitted().len(), 2);
        assert_eq!(pool.pending_count(), 2);
    }

    #[tokio::test]
    async fn adaptive_growth_parks_after_two_simultaneous_pending() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(3, &test_spec(), GrowthPolicy::Adaptive).await;
        assert_eq!(achieved, 0);
        assert_eq!(stub.submitted().len(), 2);
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.parked_count(), 1);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn promotion_picks_up_parked_workers_when_the_queue_drains() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        pool.grow(3, &test_spec(), GrowthPolicy::Adaptive).await;
        assert_eq!(pool.parked_count(), 1);

        stub.set_mode(StubMode::Instant);
        let promoted = pool.promote_parked().await;
        assert_eq!(promoted, 1);
        assert_eq!(stub.submitted().len(), 3);
        assert_eq!(pool.parked_count(), 0);
        let states = pool.poll_states().await;
        assert!(states.iter().all(|s| *s == WorkerState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_growth_counts_parked_slots_without_submitting_them() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        pool.grow(3, &test_spec(), GrowthPolicy::Adaptive).await;
        assert_eq!(stub.submitted().len(), 2);

        // The parked worker occupies a slot, so plain growth submits
        // nothing and leaves it alone.
        pool.grow(3, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(stub.submitted().len(), 2);
        assert_eq!(pool.parked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_growth_discards_what_stays_pending() {
        let stub = StubBackend::new(StubMode::RunFromSubmission(2));
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(2, &test_spec(), GrowthPolicy::Busy).await;
        assert_eq!(achieved, 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.running_count(), 2);
        // The first round's two submissions never started and were
        // cancelled and dropped.
        assert_eq!(stub.submitted().len(), 4);
        assert_eq!(stub.cancelled().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_before_expiry_resubmits_the_same_spec() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        let spec = test_spec();
        pool.grow(1, &spec, GrowthPolicy::Plain).await;

        // 45 minutes into a 60 minute walltime.
        stub.set_elapsed(Duration::from_secs(2700));
        let outcome = pool.restart_near_expiry(0.75).await;
        assert_eq!(outcome.restarted.len(), 1);
        assert!(outcome.parked.is_empty());

        let submitted = stub.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].resources, spec);
        assert_eq!(submitted[1].name, submitted[0].name);
        assert_eq!(stub.cancelled().len(), 1);
        assert_eq!(pool.workers()[0].submissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_stays_put_below_the_threshold() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        pool.grow(1, &test_spec(), GrowthPolicy::Plain).await;

        // 20 minutes into a 60 minute walltime.
        stub.set_elapsed(Duration::from_secs(1200));
        let outcome = pool.restart_near_expiry(0.75).await;
        assert!(outcome.restarted.is_empty());
        assert_eq!(stub.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_defers_when_the_pending_cap_is_reached() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        pool.grow(4, &test_spec(), GrowthPolicy::Plain).await;

        // Resubmissions will sit in the queue, so the cap bites.
        stub.set_mode(StubMode::StuckFromSubmission(4));
        stub.set_elapsed(Duration::from_secs(3000));
        let outcome = pool.restart_near_expiry(0.5).await;
        assert_eq!(outcome.restarted.len(), 2);
        assert_eq!(outcome.parked.len(), 2);
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.parked_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_running_worker_is_terminated_not_faulty() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        pool.grow(1, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(pool.running_count(), 1);

        stub.vanish_all();
        let states = pool.poll_states().await;
        assert_eq!(states, vec![WorkerState::Terminated]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pending_worker_goes_faulty_after_three_polls() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        pool.grow(1, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(pool.pending_count(), 1);

        stub.vanish_all();
        assert_eq!(pool.poll_states().await, vec![WorkerState::Pending]);
        assert_eq!(pool.poll_states().await, vec![WorkerState::Pending]);
        assert_eq!(pool.poll_states().await, vec![WorkerState::Faulty]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_outage_counts_missed_polls() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        pool.grow(1, &test_spec(), GrowthPolicy::Plain).await;

        // Each refresh burns the first call and the retry.
        stub.fail_next_status(6);
        pool.poll_states().await;
        pool.poll_states().await;
        let states = pool.poll_states().await;
        assert_eq!(states, vec![WorkerState::Faulty]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submission_degrades_the_achieved_count() {
        let stub = StubBackend::new(StubMode::Instant);
        stub.fail_submits();
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(3, &test_spec(), GrowthPolicy::Plain).await;
        assert_eq!(achieved, 0);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_growth_stops_after_repeated_rejections() {
        let stub = StubBackend::new(StubMode::Instant);
        stub.fail_submits();
        let mut pool = test_pool(stub.clone());
        let achieved = pool.grow(2, &test_spec(), GrowthPolicy::Adaptive).await;
        assert_eq!(achieved, 0);
        assert!(pool.is_empty());
        // One attempt per budgeted round, then the call gives up.
        assert_eq!(stub.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn trim_prefers_live_workers_and_backfills_parked() {
        let stub = StubBackend::new(StubMode::Stuck);
        let mut pool = test_pool(stub.clone());
        pool.grow(4, &test_spec(), GrowthPolicy::Adaptive).await;
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.parked_count(), 2);

        pool.trim(3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.parked_count(), 1);
        assert!(stub.cancelled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything_and_scrubs_logs() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = WorkerPool::new(stub.clone(), "drover-worker --attach", dir.path())
            .with_options(quick_options());
        pool.grow(2, &test_spec(), GrowthPolicy::Plain).await;

        for w in pool.workers() {
            std::fs::write(w.stdout_log(), b"out").unwrap();
            std::fs::write(w.stderr_log(), b"err").unwrap();
        }

        pool.shutdown(true).await;
        assert_eq!(stub.cancelled().len(), 2);
        assert!(stub.cleaned());
        assert!(
            pool.workers()
                .iter()
                .all(|w| w.state() == WorkerState::Terminated)
        );
        for w in pool.workers() {
            assert!(!w.stdout_log().exists());
            assert!(!w.stderr_log().exists());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_of_reports_a_subset_and_rejects_unknown_ids() {
        let stub = StubBackend::new(StubMode::Instant);
        let mut pool = test_pool(stub.clone());
        pool.grow(2, &test_spec(), GrowthPolicy::Plain).await;

        let first = pool.workers()[0].id().clone();
        let states = pool.status_of(&[first]).await.unwrap();
        assert_eq!(states, vec![WorkerState::Running]);

        let stranger = IdGenerator::new().next_id();
        assert!(matches!(
            pool.status_of(&[stranger]).await,
            Err(PoolError::WorkerNotFound(_))
        ));
    }
}
