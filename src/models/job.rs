// file: src/models/job.rs
// description: per-file job record, status lifecycle and job-level errors
// reference: internal data structures

use crate::stages::{STAGE_COUNT, Stage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Why a single job failed. Recorded on the job, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobError {
    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("{stage} exceeded the {budget_secs}s job budget")]
    Timeout { stage: Stage, budget_secs: u64 },

    #[error("could not prepare output directory: {0}")]
    Setup(String),

    #[error("could not archive source file: {0}")]
    Finalize(String),
}

impl JobError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } | Self::Timeout { stage, .. } => Some(*stage),
            Self::Setup(_) | Self::Finalize(_) => None,
        }
    }
}

/// One file's traversal of the stage sequence.
///
/// Owned by exactly one worker while in flight. Once the status is terminal
/// every mutator is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub source_name: String,
    pub source_path: PathBuf,
    pub sanitized_name: String,
    stage_index: usize,
    status: JobStatus,
    error: Option<JobError>,
}

impl JobRecord {
    pub fn new(source_path: PathBuf, source_name: String, sanitized_name: String) -> Self {
        Self {
            source_name,
            source_path,
            sanitized_name,
            stage_index: 0,
            status: JobStatus::Queued,
            error: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn current_stage(&self) -> Stage {
        Stage::from_index(self.stage_index).unwrap_or(Stage::WeightedEnergyAnalysis)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn source(&self) -> &Path {
        &self.source_path
    }

    pub fn mark_running(&mut self) {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Running;
        }
    }

    /// Moves to the next stage after `stage_index` completed. Stays on the
    /// last stage once it is reached.
    pub fn advance(&mut self) {
        if !self.is_terminal() && self.stage_index + 1 < STAGE_COUNT {
            self.stage_index += 1;
        }
    }

    pub fn succeed(&mut self) {
        if !self.is_terminal() {
            self.status = JobStatus::Succeeded;
        }
    }

    pub fn fail(&mut self, error: JobError) {
        if !self.is_terminal() {
            self.status = JobStatus::Failed;
            self.error = Some(error);
        }
    }

    pub fn cancel(&mut self) {
        if !self.is_terminal() {
            self.status = JobStatus::Cancelled;
        }
    }
}

/// Terminal record handed back by the pool for one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub record: JobRecord,
    pub elapsed: Duration,
    /// Whether any stage collaborator was invoked for this job.
    pub started: bool,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        self.record.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            PathBuf::from("music/a.wav"),
            "a.wav".to_string(),
            "a".to_string(),
        )
    }

    #[test]
    fn test_new_record_is_queued() {
        let job = record();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.stage_index(), 0);
        assert_eq!(job.current_stage(), Stage::TransformAnalysis);
        assert!(job.error().is_none());
    }

    #[test]
    fn test_advance_is_monotonic_and_bounded() {
        let mut job = record();
        job.mark_running();
        for _ in 0..10 {
            let before = job.stage_index();
            job.advance();
            assert!(job.stage_index() >= before);
        }
        assert_eq!(job.stage_index(), STAGE_COUNT - 1);
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut job = record();
        job.mark_running();
        job.succeed();

        job.fail(JobError::Setup("late".to_string()));
        job.cancel();
        job.advance();

        assert_eq!(job.status(), JobStatus::Succeeded);
        assert!(job.error().is_none());
        assert_eq!(job.stage_index(), 0);
    }

    #[test]
    fn test_failure_keeps_stage() {
        let mut job = record();
        job.mark_running();
        job.advance();
        job.advance();
        job.fail(JobError::Stage {
            stage: job.current_stage(),
            message: "bad header".to_string(),
        });

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().and_then(JobError::stage), Some(Stage::EnergyExtraction));
    }

    #[test]
    fn test_mark_running_only_from_queued() {
        let mut job = record();
        job.cancel();
        job.mark_running();
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
}
