// file: src/pipeline/processor.rs
// description: drives one file through the ordered analysis stages
// reference: blocking stage collaborators run on the spawn_blocking pool

use crate::models::{JobError, JobOutcome, JobRecord};
use crate::pipeline::progress::{JobLog, LogLevel};
use crate::pipeline::state::{BatchState, Checkpoint};
use crate::stages::{Stage, StageInput, StageSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, warn};

/// Runs the stage sequence for one job at a time.
///
/// Between stages the runner passes the shared checkpoint, so a pause takes
/// effect at the next stage boundary and a stop cancels the job there.
pub struct JobRunner {
    stages: StageSet,
    state: Arc<BatchState>,
    output_root: PathBuf,
    job_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        stages: StageSet,
        state: Arc<BatchState>,
        output_root: PathBuf,
        job_timeout: Duration,
    ) -> Self {
        Self {
            stages,
            state,
            output_root,
            job_timeout,
        }
    }

    pub fn output_dir_for(&self, record: &JobRecord) -> PathBuf {
        self.output_root.join(&record.sanitized_name)
    }

    pub async fn run(&self, mut record: JobRecord) -> JobOutcome {
        let started_at = Instant::now();
        record.mark_running();

        if self.state.control.checkpoint().await == Checkpoint::Cancel {
            record.cancel();
            return outcome(record, started_at, false);
        }

        let tracker = &self.state.tracker;
        let output_dir = self.output_dir_for(&record);
        tracker.record_job_event(
            &record.sanitized_name,
            format!("Processing file: {}", record.source_name),
            LogLevel::Info,
        );

        if let Err(e) = self.prepare_output_dir(&record, &output_dir).await {
            record.fail(JobError::Setup(e.to_string()));
            return outcome(record, started_at, false);
        }

        let mut job_log = tracker.open_job_log(&record.sanitized_name);
        tracker.record_job_log(&mut job_log, "Program Starting.", LogLevel::Info);

        let mut started = false;
        let mut active = Duration::ZERO;

        for stage in Stage::ALL.into_iter().skip(record.stage_index()) {
            if self.state.control.checkpoint().await == Checkpoint::Cancel {
                record.cancel();
                self.discard_output(&output_dir).await;
                return outcome(record, started_at, started);
            }

            tracker.record_job_event(
                &record.sanitized_name,
                format!("Processing {}: {}", record.source_name, stage.description()),
                LogLevel::Info,
            );

            started = true;
            let stage_start = Instant::now();
            let result = self.run_stage(stage, &record, &output_dir, active).await;
            active += stage_start.elapsed();

            if let Err(error) = result {
                record.fail(error);
                return outcome(record, started_at, started);
            }

            self.stage_finished(&mut job_log, stage);
            record.advance();
        }

        match self.archive_source(&record, &output_dir).await {
            Ok(()) => record.succeed(),
            Err(e) => record.fail(JobError::Finalize(e.to_string())),
        }

        outcome(record, started_at, started)
    }

    /// Runs one collaborator on the blocking pool, bounded by whatever is
    /// left of the job's active-time budget.
    async fn run_stage(
        &self,
        stage: Stage,
        record: &JobRecord,
        output_dir: &Path,
        active: Duration,
    ) -> Result<(), JobError> {
        let timeout_error = || JobError::Timeout {
            stage,
            budget_secs: self.job_timeout.as_secs(),
        };

        let remaining = self.job_timeout.saturating_sub(active);
        if remaining.is_zero() {
            return Err(timeout_error());
        }

        let function = self.stages.get(stage);
        let source = record.source_path.clone();
        let output_dir = output_dir.to_path_buf();
        let sanitized_name = record.sanitized_name.clone();
        let deadline = Instant::now() + remaining;

        let task = tokio::task::spawn_blocking(move || {
            function.run(&StageInput {
                stage,
                source: &source,
                output_dir: &output_dir,
                sanitized_name: &sanitized_name,
                deadline: Some(deadline),
            })
        });

        match tokio::time::timeout(remaining, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(_))) if Instant::now() >= deadline => {
                warn!("{} on {} ran out of time", stage, record.source_name);
                Err(timeout_error())
            }
            Ok(Ok(Err(e))) => Err(JobError::Stage {
                stage,
                message: format!("{:#}", e),
            }),
            Ok(Err(join_error)) => Err(JobError::Stage {
                stage,
                message: format!("collaborator panicked: {}", join_error),
            }),
            Err(_) => {
                // Command stages kill their child at the deadline; an
                // in-process collaborator finishes detached.
                warn!("{} on {} timed out", stage, record.source_name);
                Err(timeout_error())
            }
        }
    }

    fn stage_finished(&self, job_log: &mut JobLog, stage: Stage) {
        self.state.tracker.record_job_log(
            job_log,
            format!("{} Finished!", stage.label()),
            LogLevel::Success,
        );
    }

    /// Removes any previous output for this file, then recreates the directory.
    async fn prepare_output_dir(&self, record: &JobRecord, output_dir: &Path) -> std::io::Result<()> {
        if fs::try_exists(output_dir).await? {
            fs::remove_dir_all(output_dir).await?;
            self.state.tracker.record_job_event(
                &record.sanitized_name,
                format!("Removed previous output of {}, reprocessing", record.source_name),
                LogLevel::Warning,
            );
        }
        fs::create_dir_all(output_dir).await
    }

    /// Moves the source file into its output directory. Falls back to copy
    /// and delete when a rename crosses file systems.
    async fn archive_source(&self, record: &JobRecord, output_dir: &Path) -> std::io::Result<()> {
        let target = output_dir.join(&record.source_name);
        if fs::rename(&record.source_path, &target).await.is_ok() {
            return Ok(());
        }

        debug!("Rename failed for {}, copying instead", record.source_name);
        fs::copy(&record.source_path, &target).await?;
        fs::remove_file(&record.source_path).await
    }

    async fn discard_output(&self, output_dir: &Path) {
        if let Err(e) = fs::remove_dir_all(output_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Could not remove partial output {}: {}", output_dir.display(), e);
        }
    }
}

fn outcome(record: JobRecord, started_at: Instant, started: bool) -> JobOutcome {
    JobOutcome {
        record,
        elapsed: started_at.elapsed(),
        started,
    }
}
