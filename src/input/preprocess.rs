// file: src/input/preprocess.rs
// description: one-shot decryption and format normalization over the input directory
// reference: external converters invoked through std::process

use crate::config::{CommandSpec, ConvertConfig, DecryptConfig, PreprocessConfig};
use crate::error::{BatchError, Result};
use crate::stages::resolve_program;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// One file the preprocessing passes could not handle.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessFailure {
    pub source_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessReport {
    pub decrypted: usize,
    pub converted: usize,
    /// Container formats the decryption tool is known to mishandle.
    pub unsupported: Vec<String>,
    pub failures: Vec<PreprocessFailure>,
    pub decrypt_ran: bool,
    pub convert_ran: bool,
}

pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Runs the decryption pass, then the conversion pass. Per-file failures
    /// are collected in the report; only a missing program is an error, and
    /// only when some file actually needs it.
    pub fn run(&self, input_dir: &Path) -> Result<PreprocessReport> {
        let mut report = PreprocessReport::default();

        if let Some(decrypt) = &self.config.decrypt {
            self.decrypt_pass(decrypt, input_dir, &mut report)?;
        }
        if let Some(convert) = &self.config.convert {
            self.convert_pass(convert, input_dir, &mut report)?;
        }

        Ok(report)
    }

    fn decrypt_pass(
        &self,
        config: &DecryptConfig,
        input_dir: &Path,
        report: &mut PreprocessReport,
    ) -> Result<()> {
        for path in files_with_extensions(input_dir, &config.unsupported_extensions)? {
            let name = file_name(&path);
            warn!("{} uses a format that is not recommended, left untouched", name);
            report.unsupported.push(name);
        }

        let targets = files_with_extensions(input_dir, &config.extensions)?;
        report.decrypt_ran = true;
        if targets.is_empty() {
            return Ok(());
        }

        let program = require_program(&config.command, "decryption")?;
        for path in targets {
            let vars = [
                ("{input}", path.display().to_string()),
                ("{output_dir}", input_dir.display().to_string()),
            ];
            match run_tool(&program, &config.command.args, &vars, input_dir) {
                Ok(()) => {
                    remove_source(&path, report);
                    report.decrypted += 1;
                    info!("Decrypted {}", path.display());
                }
                Err(reason) => fail(report, &path, reason),
            }
        }

        Ok(())
    }

    fn convert_pass(
        &self,
        config: &ConvertConfig,
        input_dir: &Path,
        report: &mut PreprocessReport,
    ) -> Result<()> {
        let targets = files_with_extensions(input_dir, &config.extensions)?;
        report.convert_ran = true;
        if targets.is_empty() {
            return Ok(());
        }

        let program = require_program(&config.command, "conversion")?;
        for path in targets {
            let output = path.with_extension(&config.target_extension);
            let vars = [
                ("{input}", path.display().to_string()),
                ("{output}", output.display().to_string()),
                ("{output_dir}", input_dir.display().to_string()),
            ];
            match run_tool(&program, &config.command.args, &vars, input_dir) {
                Ok(()) if output.is_file() => {
                    remove_source(&path, report);
                    report.converted += 1;
                    info!("Converted {} -> {}", path.display(), output.display());
                }
                Ok(()) => fail(
                    report,
                    &path,
                    format!("converter produced no {}", output.display()),
                ),
                Err(reason) => fail(report, &path, reason),
            }
        }

        Ok(())
    }
}

fn require_program(command: &CommandSpec, pass: &str) -> Result<PathBuf> {
    resolve_program(&command.program).ok_or_else(|| {
        BatchError::MissingCollaborator(format!(
            "{} program '{}' not found on PATH",
            pass, command.program
        ))
    })
}

fn files_with_extensions(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if extensions.is_empty() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|source| BatchError::Enumeration {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy();
                    extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
                })
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn run_tool(
    program: &Path,
    args: &[String],
    vars: &[(&str, String)],
    cwd: &Path,
) -> std::result::Result<(), String> {
    let args: Vec<String> = args
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect();
    debug!("{} {:?}", program.display(), args);

    let output = Command::new(program)
        .args(&args)
        .current_dir(cwd)
        .output()
        .map_err(|e| format!("failed to launch {}: {}", program.display(), e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn remove_source(path: &Path, report: &mut PreprocessReport) {
    if let Err(e) = fs::remove_file(path) {
        fail(report, path, format!("processed but could not remove source: {}", e));
    }
}

fn fail(report: &mut PreprocessReport, path: &Path, reason: String) {
    let source_name = file_name(path);
    warn!("Preprocessing {} failed: {}", source_name, reason);
    report.failures.push(PreprocessFailure {
        source_name,
        reason,
    });
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
