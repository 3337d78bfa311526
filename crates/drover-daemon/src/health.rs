//! Heartbeat-based liveness.
//!
//! The monitor is stateless: heartbeats and served work are stamped on the
//! worker records by the pool, and the monitor reads those records to decide
//! which workers have gone quiet. Its verdicts are applied as
//! `HeartbeatMissed` commands by the supervisor loop.

use std::time::Duration;

use drover_core::status::WorkerState;
use tokio::time::Instant;

use crate::pool::{WorkerId, WorkerRecord};

/// Liveness classification of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heard from within the timeout.
    Healthy,
    /// Heard from, but more than one heartbeat interval ago.
    Stalled,
    /// Nothing within the timeout, or never became ready in time.
    Dead,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// The instant after which the worker is considered dead, if it is
    /// subject to liveness checks at all.
    fn deadline(&self, record: &WorkerRecord) -> Option<Instant> {
        match record.state {
            WorkerState::Starting => Some(record.started_at + self.timeout),
            WorkerState::Ready => {
                let seen = record
                    .last_heartbeat_at
                    .or(record.ready_at)
                    .unwrap_or(record.started_at);
                Some(seen + self.timeout)
            }
            WorkerState::Draining | WorkerState::Dead => None,
        }
    }

    pub fn classify(&self, record: &WorkerRecord, now: Instant) -> Liveness {
        let Some(deadline) = self.deadline(record) else {
            return Liveness::Healthy;
        };
        if now >= deadline {
            return Liveness::Dead;
        }
        let stalled = record.state == WorkerState::Ready
            && record
                .last_heartbeat_at
                .is_some_and(|seen| now.saturating_duration_since(seen) > self.interval);
        if stalled {
            Liveness::Stalled
        } else {
            Liveness::Healthy
        }
    }

    /// Workers that missed their deadline.
    pub fn overdue(&self, records: &[WorkerRecord], now: Instant) -> Vec<WorkerId> {
        records
            .iter()
            .filter(|r| self.classify(r, now) == Liveness::Dead)
            .map(|r| r.id)
            .collect()
    }

    /// Earliest instant at which a verdict can turn to [`Liveness::Dead`].
    pub fn next_check(&self, records: &[WorkerRecord]) -> Option<Instant> {
        records.iter().filter_map(|r| self.deadline(r)).min()
    }
}
