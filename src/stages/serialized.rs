// file: src/stages/serialized.rs
// description: single-consumer actor for collaborators that are not reentrant
// reference: https://doc.rust-lang.org/std/sync/mpsc/

use super::{Stage, StageFunction, StageInput};
use crate::error::{BatchError, Result};
use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

struct Request {
    stage: Stage,
    source: PathBuf,
    output_dir: PathBuf,
    sanitized_name: String,
    deadline: Option<Instant>,
    reply: Sender<anyhow::Result<()>>,
}

/// Funnels every call to the wrapped collaborator through one dedicated
/// thread, so at most one invocation runs at a time across all workers.
///
/// Callers block until their own request has been served. A panicking
/// collaborator fails only the request that triggered it.
pub struct SerializedStage {
    requests: Sender<Request>,
}

impl SerializedStage {
    pub fn spawn(stage: Stage, inner: impl StageFunction + 'static) -> Result<Self> {
        Self::spawn_shared(stage, Arc::new(inner))
    }

    pub fn spawn_shared(stage: Stage, inner: Arc<dyn StageFunction>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Request>();

        thread::Builder::new()
            .name(format!("stage-{}", stage.label().to_lowercase()))
            .spawn(move || {
                // Exits once every sender has been dropped.
                for request in rx {
                    let input = StageInput {
                        stage: request.stage,
                        source: &request.source,
                        output_dir: &request.output_dir,
                        sanitized_name: &request.sanitized_name,
                        deadline: request.deadline,
                    };
                    let result = panic::catch_unwind(AssertUnwindSafe(|| inner.run(&input)))
                        .unwrap_or_else(|payload| {
                            let reason = panic_message(payload.as_ref());
                            error!("{} collaborator panicked: {}", stage, reason);
                            Err(anyhow!("{} collaborator panicked: {}", stage, reason))
                        });
                    let _ = request.reply.send(result);
                }
                debug!("{} actor stopped", stage);
            })
            .map_err(BatchError::Io)?;

        Ok(Self { requests: tx })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl StageFunction for SerializedStage {
    fn run(&self, input: &StageInput<'_>) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = Request {
            stage: input.stage,
            source: input.source.to_path_buf(),
            output_dir: input.output_dir.to_path_buf(),
            sanitized_name: input.sanitized_name.to_string(),
            deadline: input.deadline,
            reply: reply_tx,
        };

        self.requests
            .send(request)
            .map_err(|_| anyhow!("{} actor is no longer running", input.stage))?;

        reply_rx
            .recv()
            .map_err(|_| anyhow!("{} actor dropped the request", input.stage))?
    }
}
