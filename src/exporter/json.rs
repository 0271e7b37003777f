// file: src/exporter/json.rs
// description: json export of run summaries

use crate::error::{BatchError, Result};
use crate::models::RunSummary;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUMMARY_FILE_NAME: &str = "summary.json";

#[derive(Debug, Clone)]
pub struct SummaryExporter {
    output_dir: PathBuf,
    pretty: bool,
}

impl SummaryExporter {
    pub fn new(output_dir: impl Into<PathBuf>, pretty: bool) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)
            .map_err(|source| BatchError::file_operation(&output_dir, source))?;
        Ok(Self { output_dir, pretty })
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join(SUMMARY_FILE_NAME)
    }

    /// Overwrites `summary.json` with the given run.
    pub fn export(&self, summary: &RunSummary) -> Result<PathBuf> {
        let json = if self.pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };

        let path = self.path();
        fs::write(&path, json).map_err(|source| BatchError::file_operation(&path, source))?;

        info!(
            "Run summary written to {} ({} of {} succeeded)",
            path.display(),
            summary.succeeded,
            summary.total
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<RunSummary> {
        let content =
            fs::read_to_string(path).map_err(|source| BatchError::file_operation(path, source))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SkippedFile;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn test_exporter_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("logs/run");
        assert!(SummaryExporter::new(&nested, true).is_ok());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_export_writes_readable_summary() {
        let dir = tempdir().unwrap();
        let exporter = SummaryExporter::new(dir.path(), true).unwrap();

        let mut summary = RunSummary::empty(Uuid::new_v4(), 4);
        summary.skipped.push(SkippedFile {
            source_name: "a?.wav".to_string(),
            reason: "collision".to_string(),
        });

        let path = exporter.export(&summary).unwrap();
        assert_eq!(path, dir.path().join(SUMMARY_FILE_NAME));

        let loaded = SummaryExporter::load(&path).unwrap();
        assert_eq!(loaded.run_id, summary.run_id);
        assert_eq!(loaded.workers, 4);
        assert_eq!(loaded.skipped, summary.skipped);
    }
}
