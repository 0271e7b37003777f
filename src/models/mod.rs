// file: src/models/mod.rs
// description: data models module exports
// reference: internal module structure

pub mod job;
pub mod summary;

pub use job::{JobError, JobOutcome, JobRecord, JobStatus};
pub use summary::{FailedFile, RunSummary, SkippedFile};
