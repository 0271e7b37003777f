// file: src/config.rs
// description: application configuration management with toml support
// reference: https://docs.rs/config

use crate::error::{BatchError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Absolute ceiling on the worker pool, whatever the machine looks like.
pub const HARD_WORKER_CAP: usize = 32;
/// Smallest configurable pool cap.
pub const MIN_WORKER_CAP: usize = 16;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub workers: WorkerConfig,
    pub stages: StagesConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub thread_override: Option<usize>,
    pub max_workers_cap: usize,
    pub job_timeout_secs: u64,
    /// Used when available memory cannot be read from the OS.
    pub fallback_memory_gb: f64,
    pub monitor: bool,
    pub monitor_interval_secs: u64,
    pub show_progress: bool,
    pub log_tail_capacity: usize,
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// An external program plus its argument template.
///
/// Arguments may contain `{input}`, `{output_dir}`, `{output}` and `{name}`
/// placeholders, substituted per invocation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageCommand {
    pub command: CommandSpec,
    /// Route every invocation through a single dedicated thread.
    #[serde(default)]
    pub serialized: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StagesConfig {
    pub transform_analysis: Option<StageCommand>,
    pub detailed_transform_analysis: Option<StageCommand>,
    pub energy_extraction: Option<StageCommand>,
    pub energy_plot: Option<StageCommand>,
    pub weighted_energy_analysis: Option<StageCommand>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PreprocessConfig {
    pub decrypt: Option<DecryptConfig>,
    pub convert: Option<ConvertConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecryptConfig {
    pub command: CommandSpec,
    pub extensions: Vec<String>,
    /// Formats the decryption tool handles badly; reported and left alone.
    #[serde(default)]
    pub unsupported_extensions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConvertConfig {
    pub command: CommandSpec,
    pub extensions: Vec<String>,
    pub target_extension: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub skip_patterns: Vec<String>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv().ok();

        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        } else {
            builder = builder.add_source(config::File::from(Path::new("config/default.toml")));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SPECTRA_BATCH")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| BatchError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BatchError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        let script = |name: &str| StageCommand {
            command: CommandSpec::new(
                "python3",
                &[&format!("stages/{name}.py"), "{input}", "{output_dir}"],
            ),
            serialized: false,
        };
        let plotting = |name: &str| StageCommand {
            serialized: true,
            ..script(name)
        };

        Self {
            paths: PathsConfig {
                input_dir: PathBuf::from("music_stft"),
                output_dir: PathBuf::from("data_stft"),
                log_dir: PathBuf::from("log_stft"),
            },
            workers: WorkerConfig {
                thread_override: None,
                max_workers_cap: HARD_WORKER_CAP,
                job_timeout_secs: 300,
                fallback_memory_gb: 8.0,
                monitor: true,
                monitor_interval_secs: 5,
                show_progress: true,
                log_tail_capacity: 500,
            },
            stages: StagesConfig {
                transform_analysis: Some(script("stft_unified")),
                detailed_transform_analysis: Some(script("stft_3000_detailed")),
                energy_extraction: Some(script("power")),
                energy_plot: Some(plotting("power_plt")),
                weighted_energy_analysis: Some(plotting("power_aweighted")),
            },
            preprocess: PreprocessConfig {
                decrypt: Some(DecryptConfig {
                    command: CommandSpec::new("um", &["{input}"]),
                    extensions: vec!["ncm".to_string(), "kgm".to_string(), "kwm".to_string()],
                    unsupported_extensions: vec![
                        "mflac".to_string(),
                        "qmc".to_string(),
                        "mgg".to_string(),
                    ],
                }),
                convert: Some(ConvertConfig {
                    command: CommandSpec::new(
                        "ffmpeg",
                        &["-y", "-loglevel", "error", "-i", "{input}", "{output}"],
                    ),
                    extensions: ["mp3", "aac", "ogg", "flac", "m4a", "wma"]
                        .iter()
                        .map(|e| e.to_string())
                        .collect(),
                    target_extension: "wav".to_string(),
                }),
            },
            scan: ScanConfig {
                skip_patterns: vec![".*".to_string()],
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cap = self.workers.max_workers_cap;
        if !(MIN_WORKER_CAP..=HARD_WORKER_CAP).contains(&cap) {
            return Err(BatchError::Config(format!(
                "max_workers_cap must be between {} and {} (got {})",
                MIN_WORKER_CAP, HARD_WORKER_CAP, cap
            )));
        }

        if let Some(threads) = self.workers.thread_override
            && !(1..=HARD_WORKER_CAP).contains(&threads)
        {
            return Err(BatchError::Config(format!(
                "thread_override must be between 1 and {} (got {})",
                HARD_WORKER_CAP, threads
            )));
        }

        if self.workers.job_timeout_secs == 0 {
            return Err(BatchError::Config(
                "job_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.workers.monitor_interval_secs == 0 {
            return Err(BatchError::Config(
                "monitor_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.workers.log_tail_capacity == 0 {
            return Err(BatchError::Config(
                "log_tail_capacity must be greater than 0".to_string(),
            ));
        }

        if self.workers.fallback_memory_gb <= 0.0 {
            return Err(BatchError::Config(
                "fallback_memory_gb must be positive".to_string(),
            ));
        }

        if self.paths.input_dir == self.paths.output_dir {
            return Err(BatchError::Config(
                "input_dir and output_dir must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Same configuration rooted under `base`; handy for tests and sandboxes.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        self.paths.input_dir = base.join(&self.paths.input_dir);
        self.paths.output_dir = base.join(&self.paths.output_dir);
        self.paths.log_dir = base.join(&self.paths.log_dir);
        self
    }
}
