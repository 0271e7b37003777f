// file: src/utils/telemetry.rs
// description: live cpu/memory snapshots and operation timing
// reference: /proc/meminfo and /proc/stat on linux, num_cpus elsewhere

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of the resources that bound the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_count: usize,
    pub available_memory_gb: f64,
    pub total_memory_gb: Option<f64>,
    /// False when the memory figures are the configured fallback.
    pub measured: bool,
}

impl ResourceSnapshot {
    pub fn capture(fallback_memory_gb: f64) -> Self {
        let cpu_count = num_cpus::get().max(1);

        match read_meminfo() {
            Some(mem) => Self {
                cpu_count,
                available_memory_gb: mem.available_bytes as f64 / BYTES_PER_GB,
                total_memory_gb: Some(mem.total_bytes as f64 / BYTES_PER_GB),
                measured: true,
            },
            None => {
                warn!(
                    "Available memory unknown, assuming {:.1} GB",
                    fallback_memory_gb
                );
                Self {
                    cpu_count,
                    available_memory_gb: fallback_memory_gb,
                    total_memory_gb: None,
                    measured: false,
                }
            }
        }
    }

    pub fn format(&self) -> String {
        match self.total_memory_gb {
            Some(total) => format!(
                "{} CPUs, {:.1} GB of {:.1} GB memory available",
                self.cpu_count, self.available_memory_gb, total
            ),
            None => format!(
                "{} CPUs, {:.1} GB memory assumed available",
                self.cpu_count, self.available_memory_gb
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> Option<MemInfo> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> Option<MemInfo> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let kib = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (key, kib) {
            (Some("MemTotal:"), Some(kib)) => total = Some(kib * 1024),
            (Some("MemAvailable:"), Some(kib)) => available = Some(kib * 1024),
            _ => {}
        }
    }

    Some(MemInfo {
        total_bytes: total?,
        available_bytes: available?,
    })
}

/// Tracks aggregate CPU time between calls to report utilisation.
#[derive(Debug, Default)]
pub struct CpuSampler {
    previous: Option<(u64, u64)>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self {
            previous: read_cpu_times(),
        }
    }

    /// Busy percentage since the previous sample, if the platform exposes it.
    pub fn sample(&mut self) -> Option<f64> {
        let current = read_cpu_times()?;
        let usage = self
            .previous
            .and_then(|previous| usage_between(previous, current));
        self.previous = Some(current);
        usage
    }
}

fn usage_between((prev_idle, prev_total): (u64, u64), (idle, total): (u64, u64)) -> Option<f64> {
    let total_delta = total.checked_sub(prev_total)?;
    let idle_delta = idle.checked_sub(prev_idle)?;
    if total_delta == 0 {
        return None;
    }
    Some((1.0 - idle_delta as f64 / total_delta as f64) * 100.0)
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<(u64, u64)> {
    None
}

/// Returns `(idle, total)` jiffies from the aggregate `cpu` line.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();
    Some((idle, total))
}

/// Operation timer for performance tracking
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        info!("Starting operation: {}", operation);
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish_with_count(self, count: usize) -> Duration {
        let elapsed = self.elapsed();
        info!(
            "Completed operation: {} - {} items in {:.2}s ({:.2} items/sec)",
            self.operation,
            count,
            elapsed.as_secs_f64(),
            if elapsed.as_secs_f64() > 0.0 {
                count as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            }
        );
        elapsed
    }

    pub fn warn_if_slow(&self, threshold: Duration, message: &str) {
        let elapsed = self.elapsed();
        if elapsed > threshold {
            warn!(
                "Slow operation [{}]: {} took {:.2}s (threshold: {:.2}s)",
                self.operation,
                message,
                elapsed.as_secs_f64(),
                threshold.as_secs_f64()
            );
        }
    }
}
