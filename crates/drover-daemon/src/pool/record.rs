use std::collections::VecDeque;
use std::fmt;

use drover_core::status::{WorkerState, WorkerStatus};
use tokio::time::Instant;

/// Worker identifier. Unique for the lifetime of the daemon, across
/// generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited on its own while Starting or Ready.
    Crash,
    /// Missed its readiness or heartbeat deadline and was killed.
    Timeout,
    /// The process could not be spawned at all.
    LaunchFailure,
    /// Exited after being asked to drain.
    Graceful,
    /// Killed after outliving the graceful shutdown timeout.
    ForcedKill,
}

impl ExitKind {
    /// Whether this exit counts against the slot's crash budget.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Crash | Self::Timeout | Self::LaunchFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub at: Instant,
    pub kind: ExitKind,
}

/// Crash accounting carried from a worker to its replacement in the same
/// slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    pub consecutive_crashes: u32,
    pub exit_history: VecDeque<ExitRecord>,
}

impl Lineage {
    /// Append an exit, evicting the oldest entry beyond `capacity`.
    pub fn push_exit(&mut self, exit: ExitRecord, capacity: usize) {
        self.exit_history.push_back(exit);
        while self.exit_history.len() > capacity.max(1) {
            self.exit_history.pop_front();
        }
    }

    pub fn last_exit(&self) -> Option<&ExitRecord> {
        self.exit_history.back()
    }
}

/// The supervisor's view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub generation: u64,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub ready_at: Option<Instant>,
    pub last_heartbeat_at: Option<Instant>,
    pub endpoint: Option<String>,
    /// Set when the worker enters `Draining`.
    pub drain_deadline: Option<Instant>,
    pub forced_kill: bool,
    pub served: u64,
    pub lineage: Lineage,
}

impl WorkerRecord {
    pub fn new(
        id: WorkerId,
        generation: u64,
        pid: Option<u32>,
        now: Instant,
        lineage: Lineage,
    ) -> Self {
        Self {
            id,
            generation,
            state: WorkerState::Starting,
            pid,
            started_at: now,
            ready_at: None,
            last_heartbeat_at: None,
            endpoint: None,
            drain_deadline: None,
            forced_kill: false,
            served: 0,
            lineage,
        }
    }

    pub const fn consecutive_crashes(&self) -> u32 {
        self.lineage.consecutive_crashes
    }

    pub fn to_status(&self, now: Instant) -> WorkerStatus {
        let uptime = now.saturating_duration_since(self.started_at);
        WorkerStatus {
            id: self.id.get(),
            generation: self.generation,
            state: self.state,
            pid: self.pid,
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            restarts: self.lineage.consecutive_crashes,
            served: self.served,
            forced_kill: self.forced_kill,
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn exit(at: Instant) -> ExitRecord {
        ExitRecord {
            code: Some(1),
            at,
            kind: ExitKind::Crash,
        }
    }

    #[test]
    fn history_is_capped() {
        let now = Instant::now();
        let mut lineage = Lineage::default();
        for i in 0..5 {
            lineage.push_exit(exit(now + Duration::from_secs(i)), 3);
        }
        assert_eq!(lineage.exit_history.len(), 3);
        assert_eq!(
            lineage.last_exit().map(|e| e.at),
            Some(now + Duration::from_secs(4))
        );
    }

    #[test]
    fn status_reports_uptime_and_restarts() {
        let now = Instant::now();
        let mut record = WorkerRecord::new(WorkerId::new(9), 2, Some(4242), now, Lineage {
            consecutive_crashes: 2,
            exit_history: VecDeque::new(),
        });
        record.served = 5;
        let status = record.to_status(now + Duration::from_millis(1_500));
        assert_eq!(status.id, 9);
        assert_eq!(status.generation, 2);
        assert_eq!(status.uptime_ms, 1_500);
        assert_eq!(status.restarts, 2);
        assert_eq!(status.served, 5);
        assert_eq!(status.state, WorkerState::Starting);
    }

    #[test]
    fn only_unplanned_exits_are_failures() {
        assert!(ExitKind::Crash.is_failure());
        assert!(ExitKind::Timeout.is_failure());
        assert!(ExitKind::LaunchFailure.is_failure());
        assert!(!ExitKind::Graceful.is_failure());
        assert!(!ExitKind::ForcedKill.is_failure());
    }
}
