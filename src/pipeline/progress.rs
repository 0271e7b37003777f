// file: src/pipeline/progress.rs
// description: shared counters, run/job log sinks and progress bar for a batch run
// reference: uses indicatif for progress bars and tracks processing metrics

use crate::error::{BatchError, Result};
use crate::models::{JobRecord, JobStatus};
use crate::utils::logging::{log_line, timestamp};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const RUN_LOG_NAME: &str = "log_main.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    /// Sanitized name of the job the message belongs to, if any.
    pub job: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    pub percent: f64,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Append-only text log for one job, owned by the worker running it.
#[derive(Debug)]
pub struct JobLog {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl JobLog {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, message: &str) {
        if let Some(file) = self.file.as_mut()
            && let Err(e) = writeln!(file, "{}", log_line(message))
        {
            warn!("Failed to write job log {}: {}", self.path.display(), e);
        }
    }
}

/// Thread-safe counters and log fan-out shared by every worker.
///
/// Every message goes to tracing, the bounded in-memory tail and the
/// optional subscriber channel. Run-level messages also go to the run log;
/// job-level messages go to that job's own log instead.
#[derive(Debug)]
pub struct ProgressTracker {
    main_bar: ProgressBar,
    detail_bar: ProgressBar,
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    log_dir: Option<PathBuf>,
    run_log: Mutex<Option<File>>,
    tail: Mutex<VecDeque<LogEntry>>,
    tail_capacity: usize,
    subscriber: Mutex<Option<mpsc::UnboundedSender<LogEntry>>>,
}

impl ProgressTracker {
    /// Tracker that keeps logs in memory only.
    pub fn in_memory(tail_capacity: usize) -> Self {
        Self::build(None, None, tail_capacity, false)
    }

    /// Tracker that appends to `log_dir/log_main.txt` and per-job log files.
    pub fn with_log_dir(log_dir: &Path, tail_capacity: usize, show_progress: bool) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .map_err(|source| BatchError::file_operation(log_dir, source))?;

        let run_log_path = log_dir.join(RUN_LOG_NAME);
        let run_log = open_append(&run_log_path)
            .map_err(|source| BatchError::file_operation(&run_log_path, source))?;

        Ok(Self::build(
            Some(log_dir.to_path_buf()),
            Some(run_log),
            tail_capacity,
            show_progress,
        ))
    }

    fn build(
        log_dir: Option<PathBuf>,
        run_log: Option<File>,
        tail_capacity: usize,
        show_progress: bool,
    ) -> Self {
        let (main_bar, detail_bar) = if show_progress {
            let multi_progress = MultiProgress::new();
            (
                create_progress_bar(&multi_progress, 0),
                create_detail_bar(&multi_progress),
            )
        } else {
            (ProgressBar::hidden(), ProgressBar::hidden())
        };

        Self {
            main_bar,
            detail_bar,
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            log_dir,
            run_log: Mutex::new(run_log),
            tail: Mutex::new(VecDeque::with_capacity(tail_capacity.min(1024))),
            tail_capacity: tail_capacity.max(1),
            subscriber: Mutex::new(None),
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Zeroes the counters for a new run over `total` jobs.
    pub fn reset(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.cancelled.store(0, Ordering::SeqCst);
        self.main_bar.reset();
        self.main_bar.set_length(total as u64);
        self.main_bar.set_position(0);
        self.update_detail_bar();
    }

    /// Hands out the single consumer end of the live log feed. A second
    /// call replaces the first consumer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscriber) = self.subscriber.lock() {
            *subscriber = Some(tx);
        }
        rx
    }

    /// Run-level message: tracing, run log, tail and subscriber.
    pub fn record_log(&self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        emit_tracing(&message, level, None);

        if let Ok(mut run_log) = self.run_log.lock()
            && let Some(file) = run_log.as_mut()
            && let Err(e) = writeln!(file, "{}", log_line(&message))
        {
            error!("Failed to write run log: {}", e);
        }

        self.publish(LogEntry {
            timestamp: timestamp(),
            level,
            message,
            job: None,
        });
    }

    /// Opens (appending) the per-file log for `sanitized_name`.
    pub fn open_job_log(&self, sanitized_name: &str) -> JobLog {
        let Some(dir) = self.log_dir.as_ref() else {
            return JobLog {
                name: sanitized_name.to_string(),
                path: PathBuf::new(),
                file: None,
            };
        };

        let path = dir.join(format!("log_{}.txt", sanitized_name));
        let file = match open_append(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot open job log {}: {}", path.display(), e);
                None
            }
        };

        JobLog {
            name: sanitized_name.to_string(),
            path,
            file,
        }
    }

    /// Job-level message that is also persisted to the job's own log.
    pub fn record_job_log(&self, log: &mut JobLog, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        log.append(&message);
        self.record_job_event(log.name(), message, level);
    }

    /// Job-level message for the live feed only.
    pub fn record_job_event(&self, job: &str, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        emit_tracing(&message, level, Some(job));
        self.set_message(format!("{}: {}", job, message));
        self.publish(LogEntry {
            timestamp: timestamp(),
            level,
            message,
            job: Some(job.to_string()),
        });
    }

    /// Counts one terminal job. Non-terminal records are ignored.
    pub fn record_completion(&self, record: &JobRecord) -> ProgressSnapshot {
        match record.status() {
            JobStatus::Succeeded => {
                let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
                let total = self.total.load(Ordering::SeqCst);
                self.record_job_event(
                    &record.sanitized_name,
                    format!("Song-{} Finished! [{}/{}]", record.source_name, done, total),
                    LogLevel::Success,
                );
            }
            JobStatus::Failed => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                let reason = record
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.record_log(
                    format!("Error processing {}: {}", record.source_name, reason),
                    LogLevel::Error,
                );
            }
            JobStatus::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            JobStatus::Queued | JobStatus::Running => {
                warn!(
                    "Ignoring completion of non-terminal job {}",
                    record.source_name
                );
                return self.snapshot();
            }
        }

        self.main_bar.inc(1);
        self.update_detail_bar();
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        let finished = completed + failed + cancelled;

        let percent = if total == 0 {
            0.0
        } else {
            (finished as f64 / total as f64) * 100.0
        };

        ProgressSnapshot {
            completed,
            failed,
            cancelled,
            total,
            percent,
        }
    }

    /// Most recent `n` entries, oldest first.
    pub fn tail_log(&self, n: usize) -> Vec<LogEntry> {
        match self.tail.lock() {
            Ok(tail) => {
                let skip = tail.len().saturating_sub(n);
                tail.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn set_message(&self, message: String) {
        self.detail_bar.set_message(message);
    }

    pub fn finish(&self) {
        self.main_bar.finish_with_message("Processing complete");
        self.detail_bar.finish_and_clear();
    }

    fn publish(&self, entry: LogEntry) {
        if let Ok(mut subscriber) = self.subscriber.lock()
            && let Some(tx) = subscriber.as_ref()
            && tx.send(entry.clone()).is_err()
        {
            // Consumer went away; stop feeding it.
            *subscriber = None;
        }

        if let Ok(mut tail) = self.tail.lock() {
            if tail.len() >= self.tail_capacity {
                tail.pop_front();
            }
            tail.push_back(entry);
        }
    }

    fn update_detail_bar(&self) {
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        self.detail_bar
            .set_message(format!("Failed: {} | Cancelled: {}", failed, cancelled));
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.finish();
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn emit_tracing(message: &str, level: LogLevel, job: Option<&str>) {
    let job = job.unwrap_or("-");
    match level {
        LogLevel::Info | LogLevel::Success => info!(job, "{}", message),
        LogLevel::Warning => warn!(job, "{}", message),
        LogLevel::Error => error!(job, "{}", message),
    }
}

fn create_progress_bar(multi_progress: &MultiProgress, total: u64) -> ProgressBar {
    let bar = multi_progress.add(ProgressBar::new(total));
    match ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        Ok(style) => bar.set_style(style.progress_chars("█▓▒░")),
        Err(e) => warn!("Invalid progress bar template: {}", e),
    }
    bar
}

fn create_detail_bar(multi_progress: &MultiProgress) -> ProgressBar {
    let bar = multi_progress.add(ProgressBar::new(0));
    match ProgressStyle::default_bar().template("{msg}") {
        Ok(style) => bar.set_style(style),
        Err(e) => warn!("Invalid detail bar template: {}", e),
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobError;
    use crate::stages::Stage;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn finished(name: &str, status: JobStatus) -> JobRecord {
        let mut record = JobRecord::new(
            PathBuf::from(format!("{name}.wav")),
            format!("{name}.wav"),
            name.to_string(),
        );
        record.mark_running();
        match status {
            JobStatus::Succeeded => record.succeed(),
            JobStatus::Failed => record.fail(JobError::Stage {
                stage: Stage::EnergyPlot,
                message: "plot failed".to_string(),
            }),
            JobStatus::Cancelled => record.cancel(),
            _ => {}
        }
        record
    }

    #[test]
    fn test_snapshot_counts_and_percent() {
        let tracker = ProgressTracker::in_memory(10);
        tracker.reset(4);

        tracker.record_completion(&finished("a", JobStatus::Succeeded));
        tracker.record_completion(&finished("b", JobStatus::Failed));
        let snapshot = tracker.record_completion(&finished("c", JobStatus::Cancelled));

        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.total, 4);
        assert!((snapshot.percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_terminal_completion_is_ignored() {
        let tracker = ProgressTracker::in_memory(10);
        tracker.reset(1);
        let snapshot = tracker.record_completion(&finished("a", JobStatus::Running));
        assert_eq!(snapshot.finished(), 0);
    }

    #[test]
    fn test_tail_drops_oldest() {
        let tracker = ProgressTracker::in_memory(3);
        for i in 0..5 {
            tracker.record_log(format!("message {i}"), LogLevel::Info);
        }

        let tail: Vec<String> = tracker.tail_log(10).into_iter().map(|e| e.message).collect();
        assert_eq!(tail, vec!["message 2", "message 3", "message 4"]);

        let last = tracker.tail_log(1);
        assert_eq!(last[0].message, "message 4");
    }

    #[test]
    fn test_concurrent_completions_are_not_lost() {
        let tracker = Arc::new(ProgressTracker::in_memory(5));
        tracker.reset(800);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let status = if i % 2 == 0 {
                            JobStatus::Succeeded
                        } else {
                            JobStatus::Failed
                        };
                        tracker.record_completion(&finished(&format!("{t}-{i}"), status));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 400);
        assert_eq!(snapshot.failed, 400);
        assert!((snapshot.percent - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_subscriber_receives_entries() {
        let tracker = ProgressTracker::in_memory(10);
        let mut rx = tracker.subscribe();

        tracker.record_log("Format Finished.", LogLevel::Info);
        tracker.record_job_event("song", "Processing file: song.wav", LogLevel::Info);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "Format Finished.");
        assert_eq!(first.job, None);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.job.as_deref(), Some("song"));
    }

    #[test]
    fn test_dropped_subscriber_does_not_block() {
        let tracker = ProgressTracker::in_memory(10);
        drop(tracker.subscribe());
        tracker.record_log("still fine", LogLevel::Warning);
        assert_eq!(tracker.tail_log(1)[0].message, "still fine");
    }

    #[test]
    fn test_run_and_job_logs_written() {
        let dir = TempDir::new().unwrap();
        let tracker = ProgressTracker::with_log_dir(dir.path(), 10, false).unwrap();

        tracker.record_log("Program Finished Successfully!", LogLevel::Success);
        let mut job_log = tracker.open_job_log("song");
        tracker.record_job_log(&mut job_log, "Program Starting.", LogLevel::Info);
        tracker.record_job_log(&mut job_log, "STFT Finished!", LogLevel::Success);
        drop(job_log);

        let run_log = std::fs::read_to_string(dir.path().join(RUN_LOG_NAME)).unwrap();
        assert!(run_log.trim_end().ends_with("Program Finished Successfully!"));

        let job_lines: Vec<String> = std::fs::read_to_string(dir.path().join("log_song.txt"))
            .unwrap()
            .lines()
            .map(|l| l.split_once(": ").unwrap().1.to_string())
            .collect();
        assert_eq!(job_lines, vec!["Program Starting.", "STFT Finished!"]);
    }
}
