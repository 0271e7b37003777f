// file: src/utils/validation.rs
// description: input directory checks and file name sanitization
// reference: input validation patterns

use crate::error::{BatchError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::Path;

lazy_static! {
    // Characters that are illegal in a path component on at least one platform.
    static ref ILLEGAL_NAME_CHARS: Regex =
        Regex::new(r#"[<>:"/\\|?*]"#).expect("ILLEGAL_NAME_CHARS regex is valid");
}

pub struct Validator;

impl Validator {
    pub fn validate_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(BatchError::Enumeration {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "directory does not exist",
                ),
            });
        }

        if !path.is_dir() {
            return Err(BatchError::Enumeration {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path is not a directory",
                ),
            });
        }

        Ok(())
    }

    pub fn ensure_directory(path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|source| BatchError::file_operation(path, source))
    }

    /// Derives the output folder / log key for a source file name: strips
    /// illegal characters, then drops the last extension.
    ///
    /// Returns `None` when nothing usable is left.
    pub fn sanitize_file_name(name: &str) -> Option<String> {
        let cleaned = ILLEGAL_NAME_CHARS.replace_all(name, "");
        let stripped: &str = &cleaned;
        let stem = match stripped.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => stripped,
        };
        let stem = stem.trim();

        if stem.is_empty() || stem == "." || stem == ".." {
            None
        } else {
            Some(stem.to_string())
        }
    }
}
