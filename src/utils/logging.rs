// file: src/utils/logging.rs
// description: Tracing subscriber initialization and timestamped log line formatting

use colored::*;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Timestamp format used by every text log the pipeline writes.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn init_logger(colored_output: bool, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact()
        .with_ansi(colored_output);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

pub fn timestamp() -> String {
    chrono::Local::now().format(LOG_TIMESTAMP_FORMAT).to_string()
}

/// `2024-05-01 12:00:00: message`
pub fn log_line(message: &str) -> String {
    format!("{}: {}", timestamp(), message)
}

pub fn format_success(msg: &str) -> String {
    format!("{} {}", "✓".green().bold(), msg.green())
}

pub fn format_error(msg: &str) -> String {
    format!("{} {}", "✗".red().bold(), msg.red())
}

pub fn format_warning(msg: &str) -> String {
    format!("{} {}", "⚠".yellow().bold(), msg.yellow())
}

pub fn format_info(msg: &str) -> String {
    format!("{} {}", "ℹ".blue().bold(), msg)
}

pub fn format_step(step: usize, total: usize, msg: &str) -> String {
    format!("{} {}", format!("[{}/{}]", step, total).cyan().bold(), msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_shape() {
        let line = log_line("Program Starting.");
        let (stamp, message) = line.split_once(": ").unwrap();
        assert_eq!(message, "Program Starting.");
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, LOG_TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_format_step_contains_counts() {
        colored::control::set_override(false);
        assert_eq!(format_step(2, 5, "STFT"), "[2/5] STFT");
        assert_eq!(format_success("done"), "✓ done");
    }
}
