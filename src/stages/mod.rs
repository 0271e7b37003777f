// file: src/stages/mod.rs
// description: ordered analysis stages and the collaborator contract they run through
// reference: stage functions are external black boxes; only the calling contract lives here

mod command;
mod serialized;

pub use command::{CommandStage, resolve_program};
pub use serialized::SerializedStage;

use crate::config::{StageCommand, StagesConfig};
use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Number of stages every file passes through.
pub const STAGE_COUNT: usize = 5;

/// One step of the per-file analysis sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    TransformAnalysis,
    DetailedTransformAnalysis,
    EnergyExtraction,
    EnergyPlot,
    WeightedEnergyAnalysis,
}

impl Stage {
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::TransformAnalysis,
        Stage::DetailedTransformAnalysis,
        Stage::EnergyExtraction,
        Stage::EnergyPlot,
        Stage::WeightedEnergyAnalysis,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Label written to the per-file log, e.g. `STFT-3000 Finished!`.
    pub fn label(self) -> &'static str {
        match self {
            Stage::TransformAnalysis => "STFT",
            Stage::DetailedTransformAnalysis => "STFT-3000",
            Stage::EnergyExtraction => "STFT-Power-Csv",
            Stage::EnergyPlot => "STFT-Power-Plt",
            Stage::WeightedEnergyAnalysis => "STFT-Power-Plt-A-Weighting",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::TransformAnalysis => "STFT Unified",
            Stage::DetailedTransformAnalysis => "STFT 3000 Detailed",
            Stage::EnergyExtraction => "Power CSV",
            Stage::EnergyPlot => "Power PLT",
            Stage::WeightedEnergyAnalysis => "Power A-Weighted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a stage collaborator is handed for one file.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub stage: Stage,
    pub source: &'a Path,
    pub output_dir: &'a Path,
    pub sanitized_name: &'a str,
    /// When the job's time budget runs out. Collaborators that own a
    /// child process must not let it outlive this.
    pub deadline: Option<Instant>,
}

/// A blocking analysis step supplied by an external collaborator.
///
/// Implementations write their artifacts into `input.output_dir` and report
/// failure through the returned error. They are called from a blocking
/// thread, never from the async runtime directly.
pub trait StageFunction: Send + Sync {
    fn run(&self, input: &StageInput<'_>) -> anyhow::Result<()>;
}

impl<F> StageFunction for F
where
    F: Fn(&StageInput<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, input: &StageInput<'_>) -> anyhow::Result<()> {
        self(input)
    }
}

/// The full, validated set of collaborators, one per [`Stage`].
#[derive(Clone)]
pub struct StageSet {
    functions: [Arc<dyn StageFunction>; STAGE_COUNT],
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet").finish_non_exhaustive()
    }
}

impl StageSet {
    pub fn builder() -> StageSetBuilder {
        StageSetBuilder::default()
    }

    /// Wires every stage to its configured external command.
    ///
    /// Fails fast when a stage has no command or its program cannot be
    /// resolved, so a run never starts with a hole in the pipeline.
    pub fn from_config(config: &StagesConfig) -> Result<Self> {
        let mut builder = Self::builder();

        for stage in Stage::ALL {
            let entry = stage_entry(config, stage).ok_or_else(|| {
                BatchError::MissingCollaborator(format!("no command configured for {}", stage))
            })?;

            let program = resolve_program(&entry.command.program).ok_or_else(|| {
                BatchError::MissingCollaborator(format!(
                    "{} program '{}' not found on PATH",
                    stage, entry.command.program
                ))
            })?;
            debug!("{} resolved to {}", stage, program.display());

            let command = CommandStage::new(program, entry.command.args.clone());
            builder = if entry.serialized {
                builder.with(stage, SerializedStage::spawn(stage, command)?)
            } else {
                builder.with(stage, command)
            };
        }

        builder.build()
    }

    pub fn get(&self, stage: Stage) -> Arc<dyn StageFunction> {
        Arc::clone(&self.functions[stage.index()])
    }
}

/// The configured command for `stage`, if any.
pub fn stage_entry(config: &StagesConfig, stage: Stage) -> Option<&StageCommand> {
    match stage {
        Stage::TransformAnalysis => config.transform_analysis.as_ref(),
        Stage::DetailedTransformAnalysis => config.detailed_transform_analysis.as_ref(),
        Stage::EnergyExtraction => config.energy_extraction.as_ref(),
        Stage::EnergyPlot => config.energy_plot.as_ref(),
        Stage::WeightedEnergyAnalysis => config.weighted_energy_analysis.as_ref(),
    }
}

#[derive(Default)]
pub struct StageSetBuilder {
    functions: [Option<Arc<dyn StageFunction>>; STAGE_COUNT],
}

impl StageSetBuilder {
    pub fn with(mut self, stage: Stage, function: impl StageFunction + 'static) -> Self {
        self.functions[stage.index()] = Some(Arc::new(function));
        self
    }

    pub fn with_shared(mut self, stage: Stage, function: Arc<dyn StageFunction>) -> Self {
        self.functions[stage.index()] = Some(function);
        self
    }

    pub fn build(self) -> Result<StageSet> {
        let missing: Vec<&str> = Stage::ALL
            .iter()
            .filter(|stage| self.functions[stage.index()].is_none())
            .map(|stage| stage.label())
            .collect();

        if !missing.is_empty() {
            return Err(BatchError::MissingCollaborator(format!(
                "no collaborator registered for: {}",
                missing.join(", ")
            )));
        }

        let [a, b, c, d, e] = self.functions;
        match (a, b, c, d, e) {
            (Some(a), Some(b), Some(c), Some(d), Some(e)) => Ok(StageSet {
                functions: [a, b, c, d, e],
            }),
            _ => Err(BatchError::MissingCollaborator(
                "incomplete stage set".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, StageCommand};
    use std::path::PathBuf;

    fn noop(_: &StageInput<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_stage_order_and_labels() {
        assert_eq!(Stage::from_index(0), Some(Stage::TransformAnalysis));
        assert_eq!(Stage::from_index(4), Some(Stage::WeightedEnergyAnalysis));
        assert_eq!(Stage::from_index(5), None);
        assert_eq!(Stage::EnergyExtraction.index(), 2);
        assert_eq!(Stage::DetailedTransformAnalysis.to_string(), "STFT-3000");
    }

    #[test]
    fn test_builder_reports_missing_stages() {
        let err = StageSet::builder()
            .with(Stage::TransformAnalysis, noop)
            .with(Stage::EnergyPlot, noop)
            .build()
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("STFT-3000"));
        assert!(message.contains("STFT-Power-Csv"));
        assert!(!message.contains("STFT-Power-Plt,"));
    }

    #[test]
    fn test_builder_complete_set() {
        let mut builder = StageSet::builder();
        for stage in Stage::ALL {
            builder = builder.with(stage, noop);
        }
        let set = builder.build().unwrap();

        let source = PathBuf::from("a.wav");
        let out = PathBuf::from("out");
        let input = StageInput {
            stage: Stage::EnergyPlot,
            source: &source,
            output_dir: &out,
            sanitized_name: "a",
            deadline: None,
        };
        assert!(set.get(Stage::EnergyPlot).run(&input).is_ok());
    }

    #[test]
    fn test_from_config_rejects_missing_command() {
        let config = StagesConfig::default();
        let err = StageSet::from_config(&config).unwrap_err();
        assert!(matches!(err, BatchError::MissingCollaborator(_)));
    }

    #[test]
    fn test_from_config_rejects_unresolvable_program() {
        let entry = StageCommand {
            command: CommandSpec::new("definitely-not-a-real-program-4821", &["{input}"]),
            serialized: false,
        };
        let config = StagesConfig {
            transform_analysis: Some(entry.clone()),
            detailed_transform_analysis: Some(entry.clone()),
            energy_extraction: Some(entry.clone()),
            energy_plot: Some(entry.clone()),
            weighted_energy_analysis: Some(entry),
        };

        let err = StageSet::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }
}
