// file: src/pipeline/state.rs
// description: run-wide flag shared by every worker and the checkpoint they pass between stages
// reference: https://docs.rs/tokio/latest/tokio/sync/watch/

use crate::pipeline::progress::ProgressTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Advisory run flag, written by the controller and read at checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFlag {
    Running,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Cancel,
}

/// Owner side of the run flag. `Stopping` is sticky: once set, pause and
/// resume requests are ignored.
#[derive(Debug)]
pub struct RunControl {
    flag: watch::Sender<RunFlag>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(RunFlag::Running);
        Self { flag }
    }

    pub fn current(&self) -> RunFlag {
        *self.flag.borrow()
    }

    /// Returns true when the flag actually changed.
    pub fn set(&self, next: RunFlag) -> bool {
        self.flag.send_if_modified(|flag| {
            if *flag == next || *flag == RunFlag::Stopping {
                return false;
            }
            *flag = next;
            true
        })
    }

    /// Blocks while paused; wakes on any flag change rather than polling.
    pub async fn checkpoint(&self) -> Checkpoint {
        let mut rx = self.flag.subscribe();
        match rx.wait_for(|flag| *flag != RunFlag::Paused).await {
            Ok(flag) if *flag == RunFlag::Running => Checkpoint::Proceed,
            _ => Checkpoint::Cancel,
        }
    }

    /// Resolves once the run is told to stop.
    pub async fn stopped(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|flag| *flag == RunFlag::Stopping).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<RunFlag> {
        self.flag.subscribe()
    }
}

/// Everything a worker shares with the rest of the run.
#[derive(Debug)]
pub struct BatchState {
    pub control: RunControl,
    pub tracker: Arc<ProgressTracker>,
    pub worker_count: usize,
}

impl BatchState {
    pub fn new(tracker: Arc<ProgressTracker>, worker_count: usize) -> Self {
        Self {
            control: RunControl::new(),
            tracker,
            worker_count,
        }
    }

    pub fn run_flag(&self) -> RunFlag {
        self.control.current()
    }
}
