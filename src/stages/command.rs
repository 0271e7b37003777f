// file: src/stages/command.rs
// description: stage collaborator backed by an external program
// reference: https://doc.rust-lang.org/std/process/struct.Command.html

use super::{StageFunction, StageInput};
use anyhow::{Context, anyhow, bail};
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_TAIL_CHARS: usize = 400;

/// Runs an external program once per file, substituting the file's paths
/// into the argument template.
///
/// The child is killed when the job's deadline passes, so a timed-out
/// stage never keeps running behind the worker pool's back.
#[derive(Debug, Clone)]
pub struct CommandStage {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, input: &StageInput<'_>) -> Vec<String> {
        let source = input.source.display().to_string();
        let output_dir = input.output_dir.display().to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &source)
                    .replace("{output_dir}", &output_dir)
                    .replace("{name}", input.sanitized_name)
            })
            .collect()
    }

    async fn execute(&self, args: Vec<String>, deadline: Option<Instant>) -> anyhow::Result<Output> {
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;

        let waiting = child.wait_with_output();
        let output = match deadline {
            // Dropping the wait future drops the child, which kills it.
            Some(deadline) => tokio::time::timeout_at(deadline.into(), waiting)
                .await
                .map_err(|_| {
                    warn!("{} killed at its deadline", self.program.display());
                    anyhow!("{} killed after running out of time", self.program.display())
                })?,
            None => waiting.await,
        };

        output.with_context(|| format!("failed to wait for {}", self.program.display()))
    }
}

impl StageFunction for CommandStage {
    fn run(&self, input: &StageInput<'_>) -> anyhow::Result<()> {
        if input.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            bail!("no time left to start {}", self.program.display());
        }

        let args = self.render_args(input);
        debug!("{}: {} {:?}", input.stage, self.program.display(), args);

        // Called from a blocking thread, so a private runtime drives the child.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build process runtime")?;
        let output = runtime.block_on(self.execute(args, input.deadline))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                tail(stderr.trim(), STDERR_TAIL_CHARS)
            );
        }

        Ok(())
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Locates `program` either as a direct path or on `PATH`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var).find_map(|dir| {
        let direct = dir.join(program);
        if direct.is_file() {
            return Some(direct);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{program}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Stage;

    fn input<'a>(source: &'a Path, out: &'a Path) -> StageInput<'a> {
        StageInput {
            stage: Stage::TransformAnalysis,
            source,
            output_dir: out,
            sanitized_name: "song",
            deadline: None,
        }
    }

    #[test]
    fn test_render_args() {
        let stage = CommandStage::new(
            "stft",
            vec![
                "--in={input}".to_string(),
                "{output_dir}".to_string(),
                "{name}.csv".to_string(),
            ],
        );
        let source = PathBuf::from("music/song.wav");
        let out = PathBuf::from("data/song");

        let args = stage.render_args(&input(&source, &out));
        assert_eq!(args, vec!["--in=music/song.wav", "data/song", "song.csv"]);
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[test]
    fn test_missing_program_does_not_resolve() {
        assert!(resolve_program("no-such-program-39211").is_none());
        assert!(resolve_program("/no/such/dir/tool").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_resolves_and_runs() {
        assert!(resolve_program("sh").is_some());

        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("song.wav");
        let out = dir.path().join("song");
        std::fs::create_dir_all(&out).unwrap();

        let ok = CommandStage::new(
            resolve_program("sh").unwrap(),
            vec!["-c".to_string(), "touch \"$0/result.csv\"".to_string(), "{output_dir}".to_string()],
        );
        ok.run(&input(&source, &out)).unwrap();
        assert!(out.join("result.csv").exists());

        let failing = CommandStage::new(
            resolve_program("sh").unwrap(),
            vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()],
        );
        let err = failing.run(&input(&source, &out)).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_is_killed_at_deadline() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("song.wav");
        let marker = dir.path().join("marker");

        let slow = CommandStage::new(
            resolve_program("sh").unwrap(),
            vec![
                "-c".to_string(),
                "sleep 1; touch \"$0\"".to_string(),
                marker.display().to_string(),
            ],
        );
        let mut stage_input = input(&source, dir.path());
        stage_input.deadline = Some(Instant::now() + std::time::Duration::from_millis(150));

        let started = Instant::now();
        let err = slow.run(&stage_input).unwrap_err();
        assert!(err.to_string().contains("running out of time"));
        assert!(started.elapsed() < std::time::Duration::from_millis(900));

        std::thread::sleep(std::time::Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn test_expired_deadline_skips_launch() {
        let source = PathBuf::from("song.wav");
        let out = PathBuf::from("out");
        let mut stage_input = input(&source, &out);
        stage_input.deadline = Some(Instant::now());

        let stage = CommandStage::new("no-such-program-39211", Vec::new());
        let err = stage.run(&stage_input).unwrap_err();
        assert!(err.to_string().contains("no time left"));
    }
}
