// file: src/pipeline/pool.rs
// description: worker pool sizing and semaphore-bounded job execution
// reference: https://docs.rs/tokio/latest/tokio/sync/struct.Semaphore.html

use crate::config::HARD_WORKER_CAP;
use crate::error::{BatchError, Result};
use crate::models::{JobOutcome, JobRecord};
use crate::pipeline::processor::JobRunner;
use crate::pipeline::state::BatchState;
use crate::utils::ResourceSnapshot;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Working-set estimate for one in-flight stage, in GB.
const GB_PER_WORKER: f64 = 0.8;
const CPU_OVERSUBSCRIPTION: f64 = 1.8;

/// Pool size from machine resources.
///
/// Memory bounds the count from above, the CPU count from below, and the
/// result never exceeds `min(cap, 2 * cpu_count)`.
pub fn compute_optimal_workers(cpu_count: usize, available_memory_gb: f64, cap: usize) -> usize {
    let cpu_count = cpu_count.max(1);
    let memory_bound = ((available_memory_gb.max(0.0) / GB_PER_WORKER).floor() as usize).max(1);
    let cpu_bound = (cpu_count as f64 * CPU_OVERSUBSCRIPTION).floor() as usize;

    let upper = cap.min(HARD_WORKER_CAP).min(2 * cpu_count).max(1);
    let lower = cpu_count.min(upper);

    memory_bound.min(cpu_bound).clamp(lower, upper)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Override,
    Computed,
}

/// The worker count chosen for one run and where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerPlan {
    pub workers: usize,
    pub source: PlanSource,
    pub resources: ResourceSnapshot,
}

impl WorkerPlan {
    /// Uses the override when given, otherwise sizes from `resources`.
    /// An override outside `[1, min(2 * cpu_count, 32)]` is rejected.
    pub fn resolve(
        resources: ResourceSnapshot,
        thread_override: Option<usize>,
        cap: usize,
    ) -> Result<Self> {
        match thread_override {
            Some(threads) => {
                let max = (2 * resources.cpu_count.max(1)).min(HARD_WORKER_CAP);
                if !(1..=max).contains(&threads) {
                    return Err(BatchError::Config(format!(
                        "thread count must be between 1 and {} on this machine (got {})",
                        max, threads
                    )));
                }
                Ok(Self {
                    workers: threads,
                    source: PlanSource::Override,
                    resources,
                })
            }
            None => Ok(Self {
                workers: compute_optimal_workers(
                    resources.cpu_count,
                    resources.available_memory_gb,
                    cap,
                ),
                source: PlanSource::Computed,
                resources,
            }),
        }
    }
}

/// Fixed-size pool: each submitted job waits for one of `size` permits,
/// runs to a terminal state, and reports to the shared tracker.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    accepting: AtomicBool,
    runner: Arc<JobRunner>,
    state: Arc<BatchState>,
}

impl WorkerPool {
    pub fn new(size: usize, runner: Arc<JobRunner>, state: Arc<BatchState>) -> Self {
        let size = size.max(1);
        info!("Worker pool sized at {}", size);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            accepting: AtomicBool::new(true),
            runner,
            state,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues one job. Jobs still waiting for a slot when the run stops (or
    /// the pool is shut down without draining) are cancelled without running
    /// any stage. Submissions after shutdown are cancelled outright.
    pub fn submit(&self, mut record: JobRecord) -> JoinHandle<JobOutcome> {
        let semaphore = Arc::clone(&self.semaphore);
        let runner = Arc::clone(&self.runner);
        let state = Arc::clone(&self.state);
        let accepted = self.accepting.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let queued_at = Instant::now();

            let permit = if accepted {
                tokio::select! {
                    biased;
                    _ = state.control.stopped() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                }
            } else {
                None
            };

            let outcome = match permit {
                Some(_permit) => runner.run(record).await,
                None => {
                    debug!("{} cancelled before it started", record.source_name);
                    record.cancel();
                    JobOutcome {
                        record,
                        elapsed: queued_at.elapsed(),
                        started: false,
                    }
                }
            };

            state.tracker.record_completion(&outcome.record);
            outcome
        })
    }

    /// Stops accepting submissions. With `drain_pending` false, jobs still
    /// waiting for a slot are cancelled; jobs holding one finish normally.
    pub fn shutdown(&self, drain_pending: bool) {
        self.accepting.store(false, Ordering::SeqCst);
        if !drain_pending {
            self.semaphore.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::pipeline::progress::ProgressTracker;
    use crate::pipeline::state::RunFlag;
    use crate::stages::{Stage, StageInput, StageSet};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn snapshot(cpu_count: usize, available_memory_gb: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_count,
            available_memory_gb,
            total_memory_gb: None,
            measured: false,
        }
    }

    #[test]
    fn test_optimal_workers_examples() {
        // 8 cpus, plenty of memory: cpu bound 14
        assert_eq!(compute_optimal_workers(8, 64.0, 32), 14);
        // memory bound 5 is lifted to the cpu floor
        assert_eq!(compute_optimal_workers(8, 4.0, 32), 8);
        // 32 cpus: capped
        assert_eq!(compute_optimal_workers(32, 128.0, 32), 32);
        assert_eq!(compute_optimal_workers(32, 128.0, 16), 16);
        // single cpu never exceeds 2
        assert_eq!(compute_optimal_workers(1, 64.0, 32), 1);
        assert_eq!(compute_optimal_workers(1, 0.0, 32), 1);
    }

    #[test]
    fn test_optimal_workers_monotonic_in_memory() {
        for cpus in [1, 2, 4, 6, 8, 12, 16, 24, 48] {
            let mut previous = 0;
            for tenth_gb in 0..1000 {
                let workers = compute_optimal_workers(cpus, tenth_gb as f64 / 10.0, 32);
                assert!(workers >= previous, "cpus={cpus} mem={tenth_gb}");
                assert!(workers <= 32);
                assert!(workers <= 2 * cpus);
                assert!(workers >= 1);
                previous = workers;
            }
        }
    }

    #[test]
    fn test_plan_override_bounds() {
        let resources = snapshot(4, 16.0);

        let plan = WorkerPlan::resolve(resources, Some(8), 32).unwrap();
        assert_eq!(plan.workers, 8);
        assert_eq!(plan.source, PlanSource::Override);

        assert!(WorkerPlan::resolve(resources, Some(0), 32).is_err());
        assert!(WorkerPlan::resolve(resources, Some(9), 32).is_err());

        let computed = WorkerPlan::resolve(resources, None, 32).unwrap();
        assert_eq!(computed.source, PlanSource::Computed);
        assert_eq!(computed.workers, 7);
    }

    fn counting_stages(calls: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> StageSet {
        let active = Arc::new(AtomicUsize::new(0));
        let mut builder = StageSet::builder();
        for stage in Stage::ALL {
            let calls = Arc::clone(&calls);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            builder = builder.with(stage, move |_: &StageInput<'_>| -> anyhow::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        builder.build().unwrap()
    }

    fn pool(dir: &TempDir, size: usize, stages: StageSet) -> (WorkerPool, Arc<BatchState>, PathBuf) {
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        let tracker = Arc::new(ProgressTracker::in_memory(100));
        let state = Arc::new(BatchState::new(tracker, size));
        let runner = Arc::new(JobRunner::new(
            stages,
            Arc::clone(&state),
            dir.path().join("out"),
            Duration::from_secs(30),
        ));
        (WorkerPool::new(size, runner, Arc::clone(&state)), state, input)
    }

    fn record(input: &std::path::Path, i: usize) -> JobRecord {
        let path = input.join(format!("{i}.wav"));
        std::fs::write(&path, b"RIFF").unwrap();
        JobRecord::new(path, format!("{i}.wav"), i.to_string())
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (pool, state, input) = pool(&dir, 3, counting_stages(calls.clone(), peak.clone()));
        state.tracker.reset(10);

        let handles: Vec<_> = (0..10).map(|i| pool.submit(record(&input, i))).collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().status(), JobStatus::Succeeded);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(state.tracker.snapshot().completed, 10);
    }

    #[tokio::test]
    async fn test_queued_jobs_cancelled_after_stop() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (pool, state, input) = pool(&dir, 2, counting_stages(calls.clone(), peak));
        state.tracker.reset(6);

        state.control.set(RunFlag::Stopping);
        let handles: Vec<_> = (0..6).map(|i| pool.submit(record(&input, i))).collect();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.status(), JobStatus::Cancelled);
            assert!(!outcome.started);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.tracker.snapshot().cancelled, 6);
    }

    /// First stage of job "0" blocks until `release` is set.
    fn held_stages(entered: Arc<AtomicBool>, release: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> StageSet {
        let mut builder = StageSet::builder();
        for stage in Stage::ALL {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            builder = builder.with(stage, move |input: &StageInput<'_>| -> anyhow::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                if input.stage == Stage::TransformAnalysis && input.sanitized_name == "0" {
                    entered.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
                Ok(())
            });
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting_jobs() {
        let dir = TempDir::new().unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let stages = held_stages(Arc::clone(&entered), Arc::clone(&release), Arc::clone(&calls));
        let (pool, _state, input) = pool(&dir, 1, stages);

        let first = pool.submit(record(&input, 0));
        let waiting = pool.submit(record(&input, 1));
        for _ in 0..200 {
            if entered.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(entered.load(Ordering::SeqCst));

        pool.shutdown(false);
        let late = pool.submit(record(&input, 2));
        release.store(true, Ordering::SeqCst);

        assert_eq!(first.await.unwrap().status(), JobStatus::Succeeded);
        let waiting = waiting.await.unwrap();
        assert_eq!(waiting.status(), JobStatus::Cancelled);
        assert!(!waiting.started);
        assert_eq!(late.await.unwrap().status(), JobStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_drain_runs_queued_jobs() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (pool, _state, input) = pool(&dir, 1, counting_stages(calls.clone(), peak));

        let queued: Vec<_> = (0..3).map(|i| pool.submit(record(&input, i))).collect();
        pool.shutdown(true);
        for handle in queued {
            assert_eq!(handle.await.unwrap().status(), JobStatus::Succeeded);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 15);
    }
}
