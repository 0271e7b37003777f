// file: src/pipeline/orchestrator.rs
// description: batch controller driving preprocessing, scanning, the worker pool and run summaries
// reference: orchestrates asynchronous batch workflow

use crate::config::Config;
use crate::error::{BatchError, Result};
use crate::exporter::SummaryExporter;
use crate::input::{FileScanner, Preprocessor};
use crate::models::{JobError, JobOutcome, JobRecord, RunSummary, SkippedFile};
use crate::pipeline::pool::{WorkerPlan, WorkerPool};
use crate::pipeline::processor::JobRunner;
use crate::pipeline::progress::{LogEntry, LogLevel, ProgressTracker};
use crate::pipeline::state::{BatchState, RunFlag};
use crate::stages::StageSet;
use crate::utils::{CpuSampler, OperationTimer, ResourceSnapshot, Validator};
use chrono::{DateTime, Local};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const PREPROCESS_SLOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Stopping,
    Done,
}

impl Phase {
    fn is_active(self) -> bool {
        matches!(self, Phase::Running | Phase::Paused | Phase::Stopping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchStatus {
    pub phase: Phase,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    pub percent: f64,
}

struct ActiveRun {
    run_id: Uuid,
    state: Arc<BatchState>,
    pool: WorkerPool,
    jobs: Vec<(JobRecord, JoinHandle<JobOutcome>)>,
    skipped: Vec<SkippedFile>,
    started_at: DateTime<Local>,
    timer: Instant,
    monitor: Option<JoinHandle<()>>,
}

struct ControllerState {
    phase: Phase,
    /// Control handle of the current run, present from `start` onwards.
    state: Option<Arc<BatchState>>,
    /// Set while `start` is still preprocessing and scanning.
    launching: bool,
    run: Option<ActiveRun>,
    last_summary: Option<RunSummary>,
}

/// Owns one batch run at a time: `idle -> running <-> paused -> stopping -> done`.
///
/// Control calls (`pause`, `resume`, `stop`, `status`) are cheap and never
/// wait on workers. A new run may start once the previous one is done.
pub struct BatchController {
    config: Config,
    stages: StageSet,
    tracker: Arc<ProgressTracker>,
    inner: Mutex<ControllerState>,
    launched: Notify,
}

impl BatchController {
    pub fn new(config: Config, stages: StageSet) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(ProgressTracker::with_log_dir(
            &config.paths.log_dir,
            config.workers.log_tail_capacity,
            config.workers.show_progress,
        )?);

        Ok(Self {
            config,
            stages,
            tracker,
            inner: Mutex::new(ControllerState {
                phase: Phase::Idle,
                state: None,
                launching: false,
                run: None,
                last_summary: None,
            }),
            launched: Notify::new(),
        })
    }

    /// Wires every stage to its configured command; fails if any is missing.
    pub fn from_config(config: Config) -> Result<Self> {
        let stages = StageSet::from_config(&config.stages)?;
        Self::new(config, stages)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    fn inner(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prepares and launches a run. Returns once every job is queued.
    ///
    /// The run is controllable from the moment this is called: a stop
    /// during preprocessing cancels every job before it starts.
    pub async fn start(&self, thread_override: Option<usize>) -> Result<()> {
        let workers_config = &self.config.workers;
        let (plan, state, previous) = {
            let mut inner = self.inner();
            if inner.phase.is_active() {
                return Err(BatchError::AlreadyRunning);
            }

            let plan = WorkerPlan::resolve(
                ResourceSnapshot::capture(workers_config.fallback_memory_gb),
                thread_override.or(workers_config.thread_override),
                workers_config.max_workers_cap,
            )?;
            let state = Arc::new(BatchState::new(Arc::clone(&self.tracker), plan.workers));

            self.tracker.reset(0);
            inner.state = Some(Arc::clone(&state));
            inner.launching = true;
            inner.last_summary = None;
            let previous = std::mem::replace(&mut inner.phase, Phase::Running);
            (plan, state, previous)
        };

        let result = self.launch(plan, state).await;

        let outcome = {
            let mut inner = self.inner();
            inner.launching = false;
            match result {
                Ok(Some(run)) => {
                    inner.run = Some(run);
                    Ok(())
                }
                // Finalized inside `launch`.
                Ok(None) => Ok(()),
                Err(e) => {
                    inner.phase = previous;
                    inner.state = None;
                    Err(e)
                }
            }
        };
        self.launched.notify_waiters();

        outcome
    }

    async fn launch(&self, plan: WorkerPlan, state: Arc<BatchState>) -> Result<Option<ActiveRun>> {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        let timer = Instant::now();
        let workers_config = &self.config.workers;
        let paths = &self.config.paths;
        info!("Run {}: {}", run_id, plan.resources.format());

        for dir in [&paths.output_dir, &paths.log_dir] {
            Validator::ensure_directory(dir)?;
        }
        Validator::validate_directory(&paths.input_dir)?;

        self.preprocess().await?;

        let scan_timer = OperationTimer::new("scan input");
        let scanner = FileScanner::new(self.config.scan.clone());
        let input_dir = paths.input_dir.clone();
        let scan = tokio::task::spawn_blocking(move || scanner.scan_directory(&input_dir)).await??;
        scan_timer.finish_with_count(scan.files.len());

        for skipped in &scan.skipped {
            self.tracker.record_log(
                format!("Skipping {}: {}", skipped.source_name, skipped.reason),
                LogLevel::Warning,
            );
        }

        self.tracker.reset(scan.files.len());

        if scan.files.is_empty() {
            self.tracker.record_log(
                format!("No audio files found in {}", paths.input_dir.display()),
                LogLevel::Warning,
            );
            let mut summary = RunSummary::empty(run_id, plan.workers);
            summary.skipped = scan.skipped;
            self.finalize(summary, &state, started_at, timer);
            return Ok(None);
        }

        self.tracker.record_log(
            format!(
                "Processing {} files with {} workers",
                scan.files.len(),
                plan.workers
            ),
            LogLevel::Info,
        );

        let runner = Arc::new(JobRunner::new(
            self.stages.clone(),
            Arc::clone(&state),
            paths.output_dir.clone(),
            workers_config.job_timeout(),
        ));
        let pool = WorkerPool::new(plan.workers, runner, Arc::clone(&state));

        let jobs = scan
            .files
            .into_iter()
            .map(|file| {
                let record = JobRecord::new(file.path, file.source_name, file.sanitized_name);
                let handle = pool.submit(record.clone());
                (record, handle)
            })
            .collect();

        let monitor = workers_config.monitor.then(|| {
            spawn_monitor(
                Arc::clone(&state),
                workers_config.monitor_interval(),
                workers_config.fallback_memory_gb,
            )
        });

        Ok(Some(ActiveRun {
            run_id,
            state,
            pool,
            jobs,
            skipped: scan.skipped,
            started_at,
            timer,
            monitor,
        }))
    }

    async fn preprocess(&self) -> Result<()> {
        let timer = OperationTimer::new("preprocess");
        let preprocessor = Preprocessor::new(self.config.preprocess.clone());
        let input_dir = self.config.paths.input_dir.clone();
        let report = tokio::task::spawn_blocking(move || preprocessor.run(&input_dir)).await??;
        timer.warn_if_slow(PREPROCESS_SLOW, "decrypt and convert passes");
        timer.finish_with_count(report.decrypted + report.converted);

        for name in &report.unsupported {
            self.tracker.record_log(
                format!("{} is not a recommended format and was left untouched", name),
                LogLevel::Warning,
            );
        }
        for failure in &report.failures {
            self.tracker.record_log(
                format!("Preprocessing {} failed: {}", failure.source_name, failure.reason),
                LogLevel::Error,
            );
        }
        if report.decrypt_ran {
            self.tracker.record_log("Encryption Finished.", LogLevel::Info);
        }
        if report.convert_ran {
            self.tracker.record_log("Format Finished.", LogLevel::Info);
        }
        Ok(())
    }

    /// Finishes in-flight stages, then pauses at the next stage boundary.
    pub fn pause(&self) -> bool {
        self.transition(Phase::Running, Phase::Paused, RunFlag::Paused, "Batch paused")
    }

    pub fn resume(&self) -> bool {
        self.transition(Phase::Paused, Phase::Running, RunFlag::Running, "Batch resumed")
    }

    fn transition(&self, from: Phase, to: Phase, flag: RunFlag, message: &str) -> bool {
        let mut inner = self.inner();
        if inner.phase != from {
            return false;
        }
        let Some(state) = inner.state.as_ref() else {
            return false;
        };
        state.control.set(flag);
        inner.phase = to;
        drop(inner);

        self.tracker.record_log(message, LogLevel::Info);
        true
    }

    /// Queued jobs are cancelled without running; in-flight jobs stop after
    /// their current stage.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner();
        if !matches!(inner.phase, Phase::Running | Phase::Paused) {
            return false;
        }
        let Some(state) = inner.state.as_ref() else {
            return false;
        };
        state.control.set(RunFlag::Stopping);
        if let Some(run) = inner.run.as_ref() {
            run.pool.shutdown(false);
        }
        inner.phase = Phase::Stopping;
        drop(inner);

        self.tracker
            .record_log("Stop requested, finishing current stages", LogLevel::Warning);
        true
    }

    pub fn status(&self) -> BatchStatus {
        let phase = self.inner().phase;
        let snapshot = self.tracker.snapshot();
        BatchStatus {
            phase,
            completed: snapshot.completed,
            failed: snapshot.failed,
            cancelled: snapshot.cancelled,
            total: snapshot.total,
            percent: snapshot.percent,
        }
    }

    pub fn tail_log(&self, n: usize) -> Vec<LogEntry> {
        self.tracker.tail_log(n)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogEntry> {
        self.tracker.subscribe()
    }

    /// Waits for every job to reach a terminal state and writes the run
    /// summary. Waits for a `start` still in progress; a run that ended
    /// during `start` returns its stored summary.
    pub async fn await_completion(&self) -> Result<RunSummary> {
        let (jobs, state) = loop {
            let launched = self.launched.notified();
            {
                let mut inner = self.inner();
                if !inner.launching {
                    match inner.run.as_mut() {
                        Some(run) => break (std::mem::take(&mut run.jobs), Arc::clone(&run.state)),
                        None => {
                            return inner.last_summary.clone().ok_or(BatchError::NotRunning);
                        }
                    }
                }
            }
            launched.await;
        };

        let joined = join_all(
            jobs.into_iter()
                .map(|(record, handle)| async move { (record, handle.await) }),
        )
        .await;

        let mut records = Vec::with_capacity(joined.len());
        for (mut record, result) in joined {
            match result {
                Ok(outcome) => records.push(outcome.record),
                Err(e) => {
                    error!("Worker for {} aborted: {}", record.source_name, e);
                    record.fail(JobError::Setup(format!("worker aborted: {}", e)));
                    self.tracker.record_completion(&record);
                    records.push(record);
                }
            }
        }

        let finished = self.inner().run.take();
        let Some(run) = finished else {
            // Another caller finished this run concurrently.
            return self.inner().last_summary.clone().ok_or(BatchError::NotRunning);
        };

        if let Some(monitor) = run.monitor {
            monitor.abort();
            let _ = monitor.await;
        }

        let mut summary = RunSummary::empty(run.run_id, run.pool.size());
        summary.skipped = run.skipped;
        summary.absorb(records.iter());
        Ok(self.finalize(summary, &state, run.started_at, run.timer))
    }

    fn finalize(
        &self,
        mut summary: RunSummary,
        state: &BatchState,
        started_at: DateTime<Local>,
        timer: Instant,
    ) -> RunSummary {
        summary.started_at = started_at.to_rfc3339();
        summary.finished_at = Local::now().to_rfc3339();
        summary.duration_secs = timer.elapsed().as_secs_f64();
        summary.stopped_by_user = state.run_flag() == RunFlag::Stopping;

        info!("=== Batch Summary ===");
        info!("Duration: {:.2} seconds", summary.duration_secs);
        info!("Workers: {}", summary.workers);
        info!(
            "Succeeded: {} | Failed: {} | Cancelled: {} | Total: {}",
            summary.succeeded, summary.failed, summary.cancelled, summary.total
        );
        for failure in &summary.failures {
            let stage = failure
                .stage
                .map(|s| s.label().to_string())
                .unwrap_or_else(|| "-".to_string());
            warn!("  {} [{}]: {}", failure.source_name, stage, failure.reason);
        }
        info!("=====================");

        match SummaryExporter::new(&self.config.paths.log_dir, true)
            .and_then(|exporter| exporter.export(&summary))
        {
            Ok(_) => {}
            Err(e) => error!("Could not write run summary: {}", e),
        }

        if summary.stopped_by_user {
            self.tracker
                .record_log("Program Stopped by user!", LogLevel::Warning);
        } else if summary.total > 0 {
            self.tracker
                .record_log("Program Finished Successfully!", LogLevel::Success);
        }
        self.tracker.finish();

        let mut inner = self.inner();
        inner.phase = Phase::Done;
        inner.state = None;
        inner.last_summary = Some(summary.clone());
        summary
    }
}

/// Emits a CPU/memory line to the log channel every `interval` until the
/// run stops or the task is aborted.
fn spawn_monitor(state: Arc<BatchState>, interval: Duration, fallback_memory_gb: f64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = CpuSampler::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = state.control.stopped() => break,
                _ = ticker.tick() => {}
            }

            let resources = ResourceSnapshot::capture(fallback_memory_gb);
            let cpu = sampler
                .sample()
                .map(|usage| format!("{:.1}%", usage))
                .unwrap_or_else(|| "n/a".to_string());
            state.tracker.record_log(
                format!(
                    "CPU usage: {} | memory available: {:.2} GB",
                    cpu, resources.available_memory_gb
                ),
                LogLevel::Info,
            );
        }
    })
}
