//! Daemon error types.

use thiserror::Error;

use crate::pool::WorkerId;

/// Errors surfaced by the pool, the dispatcher and the control path.
///
/// Cloneable so a single failure can be reported both to the log and to the
/// operator waiting on the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A listening socket could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Configuration rejected at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker exited while it was expected to keep running.
    #[error("worker {id} crashed (exit code {})", fmt_code(.code))]
    WorkerCrash { id: WorkerId, code: Option<i32> },

    /// A worker missed its readiness or heartbeat deadline.
    #[error("worker {id} missed its heartbeat deadline")]
    WorkerTimeout { id: WorkerId },

    /// A slot crashed too often within the restart window and was halted.
    #[error("crash loop detected: slot of worker {id} crashed {crashes} times within {window_ms}ms")]
    CrashLoopDetected {
        id: WorkerId,
        crashes: usize,
        window_ms: u64,
    },

    /// No worker could take the connection and the dispatch queue is full.
    #[error("no capacity: {queued} connections already queued")]
    NoCapacity { queued: usize },

    /// The worker process could not be spawned.
    #[error("failed to launch worker {id}: {reason}")]
    Launch { id: WorkerId, reason: String },

    /// A worker event referred to a worker the pool no longer tracks.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The supervisor task is gone.
    #[error("supervisor is shut down")]
    ShuttingDown,
}

#[allow(clippy::ref_option)]
fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl From<drover_core::Error> for PoolError {
    fn from(e: drover_core::Error) -> Self {
        Self::Config(e.to_string())
    }
}
