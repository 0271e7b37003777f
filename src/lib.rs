// file: src/lib.rs
// description: library entry point and public api exports
// reference: rust library patterns

pub mod config;
pub mod error;
pub mod exporter;
pub mod input;
pub mod models;
pub mod pipeline;
pub mod stages;
pub mod utils;

pub use config::{Config, PathsConfig, PreprocessConfig, ScanConfig, StagesConfig, WorkerConfig};
pub use error::{BatchError, Result};
pub use exporter::SummaryExporter;
pub use input::{FileScanner, PreprocessReport, Preprocessor, ScannedFile};
pub use models::{FailedFile, JobError, JobOutcome, JobRecord, JobStatus, RunSummary, SkippedFile};
pub use pipeline::{
    BatchController, BatchStatus, LogEntry, LogLevel, Phase, ProgressSnapshot, ProgressTracker,
    RunFlag, WorkerPlan, compute_optimal_workers,
};
pub use stages::{
    CommandStage, SerializedStage, Stage, StageFunction, StageInput, StageSet, resolve_program,
    stage_entry,
};
pub use utils::{OperationTimer, ResourceSnapshot, Validator};
