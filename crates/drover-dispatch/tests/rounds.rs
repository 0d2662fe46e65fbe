//! End-to-end dispatch rounds over loopback TCP with real worker loops.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use drover_dispatch::{Accumulate, DispatchOptions, Dispatcher, ExhaustedPolicy, Maintenance};
use drover_pool::{
    BackendResult, GrowthPolicy, JobId, JobRequest, JobStatus, PoolOptions, ResourceSpec,
    SchedulerBackend, WorkerPool,
};
use drover_wire::{Record, ReplyEndpoint, Tensor, WireOptions};
use drover_worker::WorkerOptions;

fn tiny_backoff() -> WorkerOptions {
    WorkerOptions::default().with_backoff(Duration::from_millis(1), Duration::from_millis(8), 2.0)
}

fn doubling_worker(item: Record) -> anyhow::Result<Record> {
    let scale = item
        .get_i64("scale")
        .ok_or_else(|| anyhow::anyhow!("missing scale"))?;
    let dat = item
        .get_tensor("dat")
        .ok_or_else(|| anyhow::anyhow!("missing dat"))?;
    let doubled: Vec<f32> = dat
        .as_f32()
        .ok_or_else(|| anyhow::anyhow!("dat is not f32"))?
        .iter()
        .map(|v| v * 2.0)
        .collect();
    Ok(Record::new()
        .with("scale", scale)
        .with("dat", Tensor::vector_f32(doubled)))
}

async fn final_round_dispatcher() -> Dispatcher {
    let endpoint = ReplyEndpoint::bind("127.0.0.1:0", WireOptions::default())
        .await
        .unwrap();
    Dispatcher::new(endpoint)
        .with_options(DispatchOptions::default().with_exhausted(ExhaustedPolicy::Done))
}

#[tokio::test]
async fn five_chunks_two_workers_reduce_to_thirty() {
    let mut dispatcher = final_round_dispatcher().await;
    let addr = dispatcher.local_addr();

    let workers: Vec<_> = (0..2)
        .map(|_| tokio::spawn(drover_worker::run(addr, tiny_backoff(), doubling_worker)))
        .collect();

    let items = (1..=5i64).map(|k| {
        Record::new()
            .with("scale", k)
            .with("dat", Tensor::vector_f32(vec![k as f32]))
    });
    let acc = dispatcher
        .sum("scale", "dat", 5, items, &[1], None)
        .await
        .unwrap();
    dispatcher.drain(Duration::from_millis(250)).await;

    // 2 * (1 + 2 + 3 + 4 + 5)
    assert_eq!(acc.buffer().as_f32().unwrap(), &[30.0]);
    assert_eq!(acc.control().len(), 5);

    let mut total = 0;
    for worker in workers {
        let report = worker.await.unwrap().unwrap();
        total += report.processed;
    }
    assert_eq!(total, 5);
}

#[tokio::test]
async fn collect_hands_each_item_out_exactly_once() {
    let mut dispatcher = final_round_dispatcher().await;
    let addr = dispatcher.local_addr();

    let workers: Vec<_> = (0..3)
        .map(|_| {
            tokio::spawn(drover_worker::run(addr, tiny_backoff(), |item: Record| {
                let tag = item
                    .get_i64("tag")
                    .ok_or_else(|| anyhow::anyhow!("missing tag"))?;
                Ok(Record::new().with("tag", tag).with("val", tag * 10))
            }))
        })
        .collect();

    let items = (1..=8i64).map(|tag| Record::new().with("tag", tag));
    let acc = dispatcher
        .collect(&["tag", "val"], 8, items, None)
        .await
        .unwrap();
    dispatcher.drain(Duration::from_millis(250)).await;
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    let tags: Vec<i64> = acc
        .column("tag")
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    let vals: Vec<i64> = acc
        .column("val")
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();

    // Arrival order is arbitrary, but every item reports exactly once and
    // each row keeps its own pairing.
    let unique: HashSet<i64> = tags.iter().copied().collect();
    assert_eq!(unique.len(), 8);
    for (tag, val) in tags.iter().zip(&vals) {
        assert_eq!(*val, tag * 10);
    }
}

/// Backend double whose queue can be unstuck mid-test: submissions sit
/// Pending until `flip`, after which everything reports Running.
struct FlipBackend {
    state: Mutex<FlipState>,
}

struct FlipState {
    running: bool,
    next_job: usize,
    jobs: HashSet<JobId>,
    submitted: usize,
}

impl FlipBackend {
    fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            state: Mutex::new(FlipState {
                running: false,
                next_job: 0,
                jobs: HashSet::new(),
                submitted: 0,
            }),
        })
    }

    fn flip(&self) {
        self.state.lock().unwrap().running = true;
    }

    fn submitted(&self) -> usize {
        self.state.lock().unwrap().submitted
    }
}

#[async_trait]
impl SchedulerBackend for FlipBackend {
    async fn submit(&self, _request: &JobRequest) -> BackendResult<JobId> {
        let mut st = self.state.lock().unwrap();
        let job = JobId::new(format!("job-{}", st.next_job));
        st.next_job += 1;
        st.submitted += 1;
        st.jobs.insert(job.clone());
        Ok(job)
    }

    async fn status(&self, jobs: &[JobId]) -> BackendResult<HashMap<JobId, JobStatus>> {
        let st = self.state.lock().unwrap();
        let mut out = HashMap::new();
        for job in jobs {
            if st.jobs.contains(job) {
                let status = if st.running {
                    JobStatus::running(None)
                } else {
                    JobStatus::pending()
                };
                out.insert(job.clone(), status);
            }
        }
        Ok(out)
    }

    async fn cancel(&self, job: &JobId) -> BackendResult<()> {
        self.state.lock().unwrap().jobs.remove(job);
        Ok(())
    }
}

#[tokio::test]
async fn maintenance_promotes_parked_workers_mid_round() {
    let backend = FlipBackend::new();
    let mut pool = WorkerPool::new(backend.clone(), "drover-worker --attach", "/tmp/drover-logs")
        .with_options(
            PoolOptions::default()
                .with_poll_interval(Duration::from_millis(5))
                .with_poll_attempts(1),
        );
    let spec = ResourceSpec::new(1, 2, Duration::from_secs(600), "debug");

    // A congested queue leaves one worker parked.
    pool.grow(3, &spec, GrowthPolicy::Adaptive).await;
    assert_eq!(pool.parked_count(), 1);
    assert_eq!(backend.submitted(), 2);
    backend.flip();

    let mut dispatcher = final_round_dispatcher().await;
    let addr = dispatcher.local_addr();
    let worker = tokio::spawn(drover_worker::run(addr, tiny_backoff(), |item: Record| {
        // Slow enough that the maintenance interval fires mid-round.
        std::thread::sleep(Duration::from_millis(15));
        Ok(item)
    }));

    let items = (0..6i64).map(|i| Record::new().with("i", i));
    let maintenance = Maintenance::new(&mut pool, Duration::from_millis(30));
    let acc = dispatcher
        .collect(&["i"], 6, items, Some(maintenance))
        .await
        .unwrap();
    dispatcher.drain(Duration::from_millis(250)).await;
    worker.await.unwrap().unwrap();

    assert_eq!(acc.received(), 6);
    // The parked worker was promoted between exchanges.
    assert_eq!(pool.parked_count(), 0);
    assert_eq!(backend.submitted(), 3);
    pool.poll_states().await;
    assert_eq!(pool.running_count(), 3);
}
