// file: src/main.rs
// description: commandline application entry point with command handling
// reference: application bootstrap and orchestration

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use spectra_batch::utils::logging::{
    format_error, format_info, format_step, format_success, format_warning,
};
use spectra_batch::{
    BatchController, Config, LogEntry, LogLevel, ResourceSnapshot, RunSummary, Stage, StageSet,
    Validator, WorkerPlan, resolve_program, stage_entry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spectra_batch")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent batch runner for spectral audio analysis", long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/default.toml"
    )]
    config: PathBuf,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    color: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every file in the input directory
    Start {
        /// Worker count, between 1 and twice the CPU count
        #[arg(short, long, value_name = "NUM")]
        threads: Option<usize>,

        #[arg(long)]
        no_monitor: bool,

        #[arg(long)]
        no_progress: bool,
    },

    /// Check that every stage and preprocessing program can be found
    Check,

    /// Show machine resources and the worker count they yield
    Workers,

    /// Create the input, output and log directories
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    spectra_batch::utils::logging::init_logger(cli.color, cli.verbose);
    colored::control::set_override(cli.color);

    info!("Loading configuration from: {}", cli.config.display());

    let config = if cli.config.exists() {
        Config::load(Some(cli.config.as_path())).context("Failed to load configuration")?
    } else {
        warn!(
            "Config file {} not found, using default configuration",
            cli.config.display()
        );
        Config::default_config()
    };

    match cli.command {
        Commands::Start {
            threads,
            no_monitor,
            no_progress,
        } => {
            cmd_start(config, threads, no_monitor, no_progress).await?;
        }
        Commands::Check => {
            cmd_check(&config)?;
        }
        Commands::Workers => {
            cmd_workers(&config)?;
        }
        Commands::Init => {
            cmd_init(&config)?;
        }
    }

    Ok(())
}

async fn cmd_start(
    mut config: Config,
    threads: Option<usize>,
    no_monitor: bool,
    no_progress: bool,
) -> Result<()> {
    if no_monitor {
        config.workers.monitor = false;
    }
    if no_progress {
        config.workers.show_progress = false;
    }

    let controller =
        Arc::new(BatchController::from_config(config).context("Dependency check failed")?);

    println!(
        "{}",
        format_info("Commands: pause | resume | stop | status | tail [n]")
    );
    // Controls are live while preprocessing and scanning run.
    let console = tokio::spawn(control_loop(Arc::clone(&controller)));

    let launch = controller.start(threads);
    tokio::pin!(launch);

    loop {
        tokio::select! {
            started = &mut launch => {
                if let Err(e) = started {
                    console.abort();
                    return Err(e).context("Failed to start batch (does the input directory exist? see `init`)");
                }
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                request_stop(&controller);
            }
        }
    }

    let completion = controller.await_completion();
    tokio::pin!(completion);

    let summary = loop {
        tokio::select! {
            summary = &mut completion => break summary.context("Batch run failed")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                request_stop(&controller);
            }
        }
    };

    console.abort();
    print_summary(&summary);
    Ok(())
}

fn request_stop(controller: &BatchController) {
    if controller.stop() {
        println!("{}", format_warning("Stopping after current stages..."));
    }
}

/// Reads control commands from stdin until EOF.
async fn control_loop(controller: Arc<BatchController>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("pause") => report(controller.pause(), "Paused", "Not running"),
            Some("resume") => report(controller.resume(), "Resumed", "Not paused"),
            Some("stop") => report(controller.stop(), "Stopping", "Nothing to stop"),
            Some("status") => {
                let status = controller.status();
                println!(
                    "{} {:?}: {} done, {} failed, {} cancelled ({:.1}%)",
                    format_step(status.completed, status.total, "status"),
                    status.phase,
                    status.completed,
                    status.failed,
                    status.cancelled,
                    status.percent
                );
            }
            Some("tail") => {
                let n = words.next().and_then(|n| n.parse().ok()).unwrap_or(20);
                for entry in controller.tail_log(n) {
                    println!("{}", render_entry(&entry));
                }
            }
            Some(other) => println!("{}", format_warning(&format!("Unknown command: {}", other))),
            None => {}
        }
    }
}

fn report(changed: bool, done: &str, ignored: &str) {
    if changed {
        println!("{}", format_success(done));
    } else {
        println!("{}", format_warning(ignored));
    }
}

fn render_entry(entry: &LogEntry) -> String {
    let line = format!("{}: {}", entry.timestamp, entry.message);
    match entry.level {
        LogLevel::Info => format_info(&line),
        LogLevel::Success => format_success(&line),
        LogLevel::Warning => format_warning(&line),
        LogLevel::Error => format_error(&line),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Run {} ({} workers, {:.1}s)", summary.run_id, summary.workers, summary.duration_secs);
    println!(
        "{}",
        format_success(&format!(
            "{} of {} files succeeded ({:.1}%)",
            summary.succeeded,
            summary.total,
            summary.success_rate()
        ))
    );

    if summary.failed > 0 {
        println!("{}", format_error(&format!("{} failed:", summary.failed)));
        for failure in &summary.failures {
            let stage = failure.stage.map(|s| s.label()).unwrap_or("-");
            println!("    {} [{}]: {}", failure.source_name, stage, failure.reason);
        }
    }
    if summary.cancelled > 0 {
        println!("{}", format_warning(&format!("{} cancelled", summary.cancelled)));
    }
    for skipped in &summary.skipped {
        println!(
            "{}",
            format_warning(&format!("skipped {}: {}", skipped.source_name, skipped.reason))
        );
    }
}

fn cmd_check(config: &Config) -> Result<()> {
    let mut programs: Vec<(String, String)> = Stage::ALL
        .iter()
        .map(|stage| {
            let program = stage_entry(&config.stages, *stage)
                .map(|entry| entry.command.program.clone())
                .unwrap_or_default();
            (stage.label().to_string(), program)
        })
        .collect();

    if let Some(decrypt) = &config.preprocess.decrypt {
        programs.push(("decrypt".to_string(), decrypt.command.program.clone()));
    }
    if let Some(convert) = &config.preprocess.convert {
        programs.push(("convert".to_string(), convert.command.program.clone()));
    }

    for (name, program) in &programs {
        if program.is_empty() {
            println!("{}", format_error(&format!("{}: no command configured", name)));
            continue;
        }
        match resolve_program(program) {
            Some(path) => println!(
                "{}",
                format_success(&format!("{}: {}", name, path.display()))
            ),
            None => println!(
                "{}",
                format_error(&format!("{}: '{}' not found", name, program))
            ),
        }
    }

    StageSet::from_config(&config.stages).context("Stage dependency check failed")?;
    println!("{}", format_success("All stages are wired"));
    Ok(())
}

fn cmd_workers(config: &Config) -> Result<()> {
    let resources = ResourceSnapshot::capture(config.workers.fallback_memory_gb);
    let plan = WorkerPlan::resolve(
        resources,
        config.workers.thread_override,
        config.workers.max_workers_cap,
    )?;

    println!("{}", format_info(&resources.format()));
    println!(
        "{}",
        format_success(&format!("{} workers ({:?})", plan.workers, plan.source))
    );
    Ok(())
}

fn cmd_init(config: &Config) -> Result<()> {
    for dir in [
        &config.paths.input_dir,
        &config.paths.output_dir,
        &config.paths.log_dir,
    ] {
        let existed = dir.is_dir();
        Validator::ensure_directory(dir)?;
        if existed {
            println!("{}", format_info(&format!("Directory exists: {}", dir.display())));
        } else {
            println!("{}", format_success(&format!("Created directory: {}", dir.display())));
        }
    }
    Ok(())
}
