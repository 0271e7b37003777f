// file: src/pipeline/mod.rs
// description: pipeline module exports and public api
// reference: pipeline orchestration

mod orchestrator;
mod pool;
mod processor;
mod progress;
mod state;

pub use orchestrator::{BatchController, BatchStatus, Phase};
pub use pool::{PlanSource, WorkerPlan, WorkerPool, compute_optimal_workers};
pub use processor::JobRunner;
pub use progress::{
    JobLog, LogEntry, LogLevel, ProgressSnapshot, ProgressTracker, RUN_LOG_NAME,
};
pub use state::{BatchState, Checkpoint, RunControl, RunFlag};
