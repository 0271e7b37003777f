// file: src/input/scanner.rs
// description: top-level input directory enumeration with name sanitization
// reference: https://docs.rs/walkdir

use crate::config::ScanConfig;
use crate::error::{BatchError, Result};
use crate::models::SkippedFile;
use crate::utils::Validator;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A regular file found directly under the input directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub source_name: String,
    pub sanitized_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Sorted by source name; sanitized names are unique.
    pub files: Vec<ScannedFile>,
    pub skipped: Vec<SkippedFile>,
}

pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Lists regular files one level deep. Subdirectories are ignored.
    ///
    /// Files whose sanitized name is empty or repeats an earlier file's are
    /// reported in [`ScanResult::skipped`] and never become jobs.
    pub fn scan_directory(&self, root: &Path) -> Result<ScanResult> {
        info!("Scanning directory: {}", root.display());
        Validator::validate_directory(root)?;

        let mut result = ScanResult::default();
        let mut claimed: HashMap<String, String> = HashMap::new();

        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    return Err(BatchError::Enumeration {
                        path: root.to_path_buf(),
                        source,
                    });
                }
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let source_name = entry.file_name().to_string_lossy().to_string();
            if self.should_skip(&source_name) {
                debug!("Skipping file: {}", source_name);
                continue;
            }

            let Some(sanitized_name) = Validator::sanitize_file_name(&source_name) else {
                warn!("No usable name left for {}, skipping", source_name);
                result.skipped.push(SkippedFile {
                    source_name,
                    reason: "sanitized name is empty".to_string(),
                });
                continue;
            };

            if let Some(existing) = claimed.get(&sanitized_name) {
                let collision = BatchError::NameCollision {
                    source_name: source_name.clone(),
                    existing: existing.clone(),
                    sanitized: sanitized_name.clone(),
                };
                warn!("{}", collision);
                result.skipped.push(SkippedFile {
                    source_name,
                    reason: collision.to_string(),
                });
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            claimed.insert(sanitized_name.clone(), source_name.clone());
            result.files.push(ScannedFile {
                path: entry.path().to_path_buf(),
                source_name,
                sanitized_name,
                size,
            });
        }

        info!(
            "Found {} files ({} skipped)",
            result.files.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Patterns match the bare file name: `*.ext` is a suffix, `prefix*` a
    /// prefix, anything else a substring.
    fn should_skip(&self, name: &str) -> bool {
        self.config.skip_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name.contains(pattern.as_str())
            }
        })
    }
}
