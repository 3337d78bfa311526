use std::fmt;

use drover_core::protocol::{CommandOutcome, ControlRequest};

use super::WorkerId;

/// Everything the supervisor loop can apply to the pool.
///
/// Operator commands come from the control socket; the rest are worker
/// events produced by launcher tasks and the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    /// Operator-facing name for a rolling reload.
    Restart,
    Reload,
    Scale(usize),
    WorkerReady { id: WorkerId, endpoint: String },
    Heartbeat(WorkerId),
    WorkServed(WorkerId),
    WorkerExited { id: WorkerId, code: Option<i32> },
    HeartbeatMissed(WorkerId),
}

impl ControlCommand {
    /// Operator commands are serialised behind an in-flight stop or reload;
    /// worker events never are.
    pub const fn is_operator(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Stop | Self::Restart | Self::Reload | Self::Scale(_)
        )
    }

    /// Map a control-socket request. `Status` is answered without touching
    /// the pool and has no command.
    pub const fn from_request(request: &ControlRequest) -> Option<Self> {
        match request {
            ControlRequest::Start => Some(Self::Start),
            ControlRequest::Stop => Some(Self::Stop),
            ControlRequest::Restart => Some(Self::Restart),
            ControlRequest::Scale { workers } => Some(Self::Scale(*workers)),
            ControlRequest::Status => None,
        }
    }
}

/// Handle for an operator command whose outcome is reported later through
/// [`PoolManager::take_finished`](super::PoolManager::take_finished).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub(crate) u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// Immediate result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A worker event was absorbed.
    Event,
    /// The operator command completed synchronously.
    Done(CommandOutcome),
    /// The operator command is deferred or still in progress.
    Pending(CommandId),
}
