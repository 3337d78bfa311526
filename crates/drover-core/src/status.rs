//! Pool status view shared by the daemon and the CLI.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

/// Worker lifecycle state: `Starting → Ready → Draining → Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Launched, waiting for the readiness message.
    Starting,
    /// Accepting dispatched work, heartbeats current.
    Ready,
    /// No new work; finishing in-flight work before exiting.
    Draining,
    /// Terminal for this record.
    Dead,
}

impl WorkerState {
    /// Whether the worker counts toward the desired worker count.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Pool-wide phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Running,
    Reloading,
    Stopping,
    Stopped,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Reloading => "reloading",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One row of the status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: u64,
    pub generation: u64,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub uptime_ms: u64,
    /// Consecutive crashes carried by this worker's slot.
    pub restarts: u32,
    pub served: u64,
    pub forced_kill: bool,
    pub endpoint: Option<String>,
}

/// A crashed slot waiting out its backoff delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRespawnStatus {
    pub previous_id: u64,
    pub due_in_ms: u64,
    pub consecutive_crashes: u32,
}

/// A slot halted by the crash-loop breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSlotStatus {
    pub last_id: u64,
    pub crashes_in_window: usize,
    pub last_exit_code: Option<i32>,
    pub halted_ms_ago: u64,
}

/// Snapshot of the whole pool as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub generation: u64,
    pub desired_workers: usize,
    pub workers: Vec<WorkerStatus>,
    pub pending_respawns: Vec<PendingRespawnStatus>,
    pub degraded: Vec<DegradedSlotStatus>,
    /// Forced kills since the daemon started.
    pub forced_kills: u64,
    /// Respawns since the daemon started.
    pub total_restarts: u64,
    /// Operator commands waiting behind an in-flight stop or reload.
    pub queued_commands: usize,
}

impl PoolStatus {
    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Render a duration in milliseconds compactly: `350ms`, `42s`, `3m07s`,
/// `2h05m`.
pub fn format_uptime(ms: u64) -> String {
    let secs = ms / 1_000;
    if secs == 0 {
        format!("{ms}ms")
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3_600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3_600, (secs % 3_600) / 60)
    }
}

/// Render the status as a plain-text table followed by pool-level notes.
pub fn render_table(status: &PoolStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "pool {} | generation {} | desired {} | ready {}",
        status.phase,
        status.generation,
        status.desired_workers,
        status.count_in(WorkerState::Ready)
    );
    let _ = writeln!(
        out,
        "{:<6} {:<4} {:<9} {:<8} {:>9} {:>8} {:>8}",
        "ID", "GEN", "STATE", "PID", "UPTIME", "RESTARTS", "SERVED"
    );
    for worker in &status.workers {
        let pid = worker.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        let state = if worker.forced_kill {
            format!("{}!", worker.state)
        } else {
            worker.state.to_string()
        };
        let _ = writeln!(
            out,
            "{:<6} {:<4} {:<9} {:<8} {:>9} {:>8} {:>8}",
            worker.id,
            worker.generation,
            state,
            pid,
            format_uptime(worker.uptime_ms),
            worker.restarts,
            worker.served
        );
    }
    if status.workers.is_empty() {
        out.push_str("(no workers)\n");
    }
    for pending in &status.pending_respawns {
        let _ = writeln!(
            out,
            "respawn pending for slot of worker {} in {} (crash #{})",
            pending.previous_id,
            format_uptime(pending.due_in_ms),
            pending.consecutive_crashes
        );
    }
    for slot in &status.degraded {
        let code = slot
            .last_exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let _ = writeln!(
            out,
            "DEGRADED: slot of worker {} halted after {} crashes (last exit {code}, {} ago)",
            slot.last_id,
            slot.crashes_in_window,
            format_uptime(slot.halted_ms_ago)
        );
    }
    let _ = writeln!(
        out,
        "restarts {} | forced kills {} | queued commands {}",
        status.total_restarts, status.forced_kills, status.queued_commands
    );
    out
}
