// file: src/models/summary.rs
// description: aggregated result of one batch run
// reference: internal data structures

use super::job::{JobRecord, JobStatus};
use crate::stages::Stage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub source_name: String,
    pub stage: Option<Stage>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub source_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
    pub workers: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub stopped_by_user: bool,
    pub failures: Vec<FailedFile>,
    pub skipped: Vec<SkippedFile>,
}

impl RunSummary {
    pub fn empty(run_id: Uuid, workers: usize) -> Self {
        let now = chrono::Local::now().to_rfc3339();
        Self {
            run_id,
            started_at: now.clone(),
            finished_at: now,
            duration_secs: 0.0,
            workers,
            total: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            stopped_by_user: false,
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Folds terminal job records into the counts. Non-terminal records
    /// are counted as cancelled since nothing will ever finish them.
    pub fn absorb<'a>(&mut self, records: impl IntoIterator<Item = &'a JobRecord>) {
        for record in records {
            self.total += 1;
            match record.status() {
                JobStatus::Succeeded => self.succeeded += 1,
                JobStatus::Failed => {
                    self.failed += 1;
                    let error = record.error();
                    self.failures.push(FailedFile {
                        source_name: record.source_name.clone(),
                        stage: error.and_then(|e| e.stage()),
                        reason: error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                JobStatus::Cancelled | JobStatus::Queued | JobStatus::Running => {
                    self.cancelled += 1
                }
            }
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && !self.stopped_by_user
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / self.total as f64) * 100.0
    }
}
