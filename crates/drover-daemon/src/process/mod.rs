//! Worker processes.
//!
//! The pool talks to workers only through [`Launcher`] and [`WorkerHandle`],
//! so the lifecycle state machine can be driven by real OS processes in the
//! daemon and by in-memory fakes in tests.

mod launcher;
mod signal;

pub use launcher::{ProcessHandle, ProcessLauncher};
pub use signal::{terminate, terminate_child};

use crate::error::PoolError;
use crate::pool::WorkerId;

/// What the pool asks a launcher to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSpec {
    pub id: WorkerId,
    pub generation: u64,
}

/// Control over one running worker.
pub trait WorkerHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to stop accepting work, finish what it has and exit.
    fn drain(&mut self);

    /// Terminate the worker immediately.
    fn kill(&mut self);
}

/// Starts workers.
///
/// Launching is synchronous: the handle is returned as soon as the process
/// exists. Readiness, heartbeats and the eventual exit are reported
/// asynchronously as pool commands.
pub trait Launcher: Send + 'static {
    type Handle: WorkerHandle;

    fn launch(&mut self, spec: LaunchSpec) -> Result<Self::Handle, PoolError>;
}
