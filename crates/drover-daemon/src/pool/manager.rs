//! The pool lifecycle state machine.
//!
//! [`PoolManager`] is synchronous and clock-injected: every operation takes
//! `now`, so the supervisor drives it from the runtime clock while tests
//! drive it from explicit instants. It never blocks; draining and respawns
//! are expressed as deadlines the caller wakes up for via
//! [`PoolManager::next_deadline`] and [`PoolManager::tick`].

use std::collections::{HashMap, VecDeque};

use drover_core::PoolConfig;
use drover_core::protocol::CommandOutcome;
use drover_core::status::{
    DegradedSlotStatus, PendingRespawnStatus, PoolPhase, PoolStatus, WorkerState,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffPolicy, CrashLoopBreaker};
use super::command::{Applied, CommandId, ControlCommand};
use super::record::{ExitKind, ExitRecord, Lineage, WorkerId, WorkerRecord};
use crate::dispatch::Route;
use crate::error::PoolError;
use crate::process::{LaunchSpec, Launcher, WorkerHandle};

/// A crashed slot waiting out its backoff delay.
#[derive(Debug)]
struct PendingRespawn {
    previous_id: WorkerId,
    due: Instant,
    lineage: Lineage,
}

/// A slot halted by the crash-loop breaker.
#[derive(Debug)]
struct DegradedSlot {
    last_id: WorkerId,
    crashes_in_window: usize,
    last_exit_code: Option<i32>,
    halted_at: Instant,
    /// A reload replacement slot: reported, but never one of the desired
    /// workers.
    surge: bool,
}

#[derive(Debug)]
struct ReloadProgress {
    command: CommandId,
    /// Pre-reload workers not yet replaced, oldest first.
    remaining: VecDeque<WorkerId>,
    /// Worker (or crashed slot awaiting respawn) currently replacing the
    /// head of `remaining`.
    replacement: Option<WorkerId>,
    replaced: usize,
}

#[derive(Debug)]
struct StopProgress {
    command: CommandId,
    forced_kills: u32,
}

/// Owns every worker record and applies commands to them.
pub struct PoolManager<L: Launcher> {
    config: PoolConfig,
    launcher: L,
    backoff: BackoffPolicy,
    breaker: CrashLoopBreaker,
    phase: PoolPhase,
    desired: usize,
    generation: u64,
    next_worker_id: u64,
    next_command_id: u64,
    /// Ordered by id, which is also start order.
    records: Vec<WorkerRecord>,
    handles: HashMap<WorkerId, L::Handle>,
    respawns: Vec<PendingRespawn>,
    degraded: Vec<DegradedSlot>,
    reload: Option<ReloadProgress>,
    stop: Option<StopProgress>,
    deferred: VecDeque<(CommandId, ControlCommand)>,
    finished: Vec<(CommandId, Result<CommandOutcome, PoolError>)>,
    forced_kills_total: u64,
    restarts_total: u64,
}

impl<L: Launcher> PoolManager<L> {
    /// Create a stopped pool. Nothing is launched until `Start`.
    pub fn new(config: PoolConfig, launcher: L) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(&config),
            breaker: CrashLoopBreaker::from_config(&config),
            desired: config.desired_worker_count,
            config,
            launcher,
            phase: PoolPhase::Stopped,
            generation: 1,
            next_worker_id: 1,
            next_command_id: 1,
            records: Vec::new(),
            handles: HashMap::new(),
            respawns: Vec::new(),
            degraded: Vec::new(),
            reload: None,
            stop: None,
            deferred: VecDeque::new(),
            finished: Vec::new(),
            forced_kills_total: 0,
            restarts_total: 0,
        }
    }

    pub const fn phase(&self) -> PoolPhase {
        self.phase
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn desired(&self) -> usize {
        self.desired
    }

    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn records(&self) -> &[WorkerRecord] {
        &self.records
    }

    /// Owned copy of every worker record.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        self.records.clone()
    }

    pub fn record(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Ready workers with a known endpoint, in start order.
    pub fn routes(&self) -> Vec<Route> {
        self.records
            .iter()
            .filter(|r| r.state == WorkerState::Ready)
            .filter_map(|r| {
                r.endpoint.as_ref().map(|endpoint| Route {
                    id: r.id,
                    endpoint: endpoint.clone(),
                })
            })
            .collect()
    }

    /// Completed deferred or long-running operator commands since the last
    /// call.
    pub fn take_finished(&mut self) -> Vec<(CommandId, Result<CommandOutcome, PoolError>)> {
        std::mem::take(&mut self.finished)
    }

    /// Apply one command.
    ///
    /// Worker events take effect immediately. Operator commands are deferred
    /// while a stop or reload is in flight and run in arrival order once it
    /// settles.
    pub fn apply(&mut self, command: ControlCommand, now: Instant) -> Result<Applied, PoolError> {
        let result = if command.is_operator() {
            let id = self.allocate_command_id();
            if self.is_transitioning() {
                debug!(%id, ?command, phase = %self.phase, "deferring command behind in-flight operation");
                self.deferred.push_back((id, command));
                Ok(Applied::Pending(id))
            } else {
                Ok(self.execute(id, command, now))
            }
        } else {
            self.on_event(command, now).map(|()| Applied::Event)
        };
        self.advance(now);
        result
    }

    /// Timer-driven work: forced kills past the drain deadline, crash counter
    /// resets and due respawns.
    pub fn tick(&mut self, now: Instant) {
        self.enforce_drain_deadlines(now);
        self.reset_stable_crash_counters(now);
        self.launch_due_respawns(now);
        self.advance(now);
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let drains = self
            .records
            .iter()
            .filter(|r| r.state == WorkerState::Draining && !r.forced_kill)
            .filter_map(|r| r.drain_deadline);
        let respawns = self.respawns.iter().map(|p| p.due);
        let window = self.config.restart_window();
        let resets = self
            .records
            .iter()
            .filter(|r| r.state == WorkerState::Ready && r.consecutive_crashes() > 0)
            .filter_map(|r| r.ready_at.map(|at| at + window));
        drains.chain(respawns).chain(resets).min()
    }

    /// Pool status as reported to operators.
    pub fn status(&self, now: Instant) -> PoolStatus {
        let millis = |d: std::time::Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        PoolStatus {
            phase: self.phase,
            generation: self.generation,
            desired_workers: self.desired,
            workers: self.records.iter().map(|r| r.to_status(now)).collect(),
            pending_respawns: self
                .respawns
                .iter()
                .map(|p| PendingRespawnStatus {
                    previous_id: p.previous_id.get(),
                    due_in_ms: millis(p.due.saturating_duration_since(now)),
                    consecutive_crashes: p.lineage.consecutive_crashes,
                })
                .collect(),
            degraded: self
                .degraded
                .iter()
                .map(|d| DegradedSlotStatus {
                    last_id: d.last_id.get(),
                    crashes_in_window: d.crashes_in_window,
                    last_exit_code: d.last_exit_code,
                    halted_ms_ago: millis(now.saturating_duration_since(d.halted_at)),
                })
                .collect(),
            forced_kills: self.forced_kills_total,
            total_restarts: self.restarts_total,
            queued_commands: self.deferred.len(),
        }
    }

    const fn is_transitioning(&self) -> bool {
        self.stop.is_some() || self.reload.is_some()
    }

    const fn allocate_command_id(&mut self) -> CommandId {
        let id = CommandId(self.next_command_id);
        self.next_command_id += 1;
        id
    }

    const fn allocate_worker_id(&mut self) -> WorkerId {
        let id = WorkerId::new(self.next_worker_id);
        self.next_worker_id += 1;
        id
    }

    fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.state.is_active()).count()
    }

    fn is_active(&self, id: WorkerId) -> bool {
        self.record(id).is_some_and(|r| r.state.is_active())
    }

    fn record_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn execute(&mut self, id: CommandId, command: ControlCommand, now: Instant) -> Applied {
        match command {
            ControlCommand::Start => Applied::Done(self.start(now)),
            ControlCommand::Scale(n) => Applied::Done(self.scale(n, now)),
            ControlCommand::Stop => {
                self.begin_stop(id, now);
                Applied::Pending(id)
            }
            ControlCommand::Restart | ControlCommand::Reload => {
                self.begin_reload(id, now);
                Applied::Pending(id)
            }
            event => {
                if let Err(e) = self.on_event(event, now) {
                    debug!(error = %e, "ignoring worker event");
                }
                Applied::Event
            }
        }
    }

    // --- operator commands ---

    fn start(&mut self, now: Instant) -> CommandOutcome {
        if self.phase == PoolPhase::Stopped {
            info!(desired = self.desired, generation = self.generation, "starting pool");
        }
        self.phase = PoolPhase::Running;
        self.degraded.clear();
        self.reconcile(now);
        CommandOutcome::Started {
            desired: self.desired,
        }
    }

    fn scale(&mut self, desired: usize, now: Instant) -> CommandOutcome {
        info!(from = self.desired, to = desired, "scaling pool");
        self.desired = desired;
        if self.degraded.len() > desired {
            let excess = self.degraded.len() - desired;
            self.degraded.drain(..excess);
        }
        if self.phase == PoolPhase::Running {
            self.reconcile(now);
        }
        CommandOutcome::Scaled { desired }
    }

    fn begin_stop(&mut self, command: CommandId, now: Instant) {
        info!(workers = self.records.len(), "stopping pool");
        self.phase = PoolPhase::Stopping;
        self.respawns.clear();
        self.degraded.clear();
        self.stop = Some(StopProgress {
            command,
            forced_kills: 0,
        });
        let active: Vec<WorkerId> = self
            .records
            .iter()
            .filter(|r| r.state.is_active())
            .map(|r| r.id)
            .collect();
        for id in active {
            self.begin_drain(id, now);
        }
    }

    fn begin_reload(&mut self, command: CommandId, now: Instant) {
        if self.phase == PoolPhase::Stopped {
            // Nothing to replace: come up directly in the next generation.
            self.generation += 1;
            self.start(now);
            self.finished.push((
                command,
                Ok(CommandOutcome::Reloaded {
                    replaced: 0,
                    generation: self.generation,
                }),
            ));
            return;
        }
        self.generation += 1;
        self.phase = PoolPhase::Reloading;
        self.degraded.clear();
        let remaining: VecDeque<WorkerId> = self
            .records
            .iter()
            .filter(|r| r.state.is_active())
            .map(|r| r.id)
            .collect();
        info!(
            generation = self.generation,
            workers = remaining.len(),
            "rolling reload started"
        );
        self.reload = Some(ReloadProgress {
            command,
            remaining,
            replacement: None,
            replaced: 0,
        });
    }

    /// Bring the number of active workers plus pending respawns to the
    /// desired count minus halted slots.
    fn reconcile(&mut self, now: Instant) {
        let halted = self.degraded.iter().filter(|d| !d.surge).count();
        let target = self.desired.saturating_sub(halted);
        let current = self.active_count() + self.respawns.len();
        if current < target {
            for _ in 0..(target - current) {
                self.spawn(Lineage::default(), now);
            }
            return;
        }
        let mut excess = current - target;
        // Cancel the respawns due last before touching running workers.
        self.respawns.sort_by_key(|p| p.due);
        while excess > 0 {
            let Some(cancelled) = self.respawns.pop() else {
                break;
            };
            debug!(previous_id = %cancelled.previous_id, "cancelled pending respawn");
            excess -= 1;
        }
        let victims: Vec<WorkerId> = self
            .records
            .iter()
            .filter(|r| r.state.is_active())
            .take(excess)
            .map(|r| r.id)
            .collect();
        for id in victims {
            self.begin_drain(id, now);
        }
    }

    // --- worker lifecycle ---

    /// Launch a worker for a slot with the given crash lineage.
    fn spawn(&mut self, lineage: Lineage, now: Instant) -> WorkerId {
        let id = self.allocate_worker_id();
        self.launch(id, lineage, now);
        id
    }

    fn launch(&mut self, id: WorkerId, lineage: Lineage, now: Instant) {
        let spec = LaunchSpec {
            id,
            generation: self.generation,
        };
        match self.launcher.launch(spec) {
            Ok(handle) => {
                let pid = handle.pid();
                debug!(%id, ?pid, generation = self.generation, "worker launched");
                self.records.push(WorkerRecord::new(
                    id,
                    self.generation,
                    pid,
                    now,
                    lineage,
                ));
                self.handles.insert(id, handle);
            }
            Err(e) => {
                error!(error = %e, "worker launch failed");
                self.on_slot_failure(id, lineage, None, ExitKind::LaunchFailure, now);
            }
        }
    }

    fn begin_drain(&mut self, id: WorkerId, now: Instant) {
        let deadline = now + self.config.graceful_shutdown_timeout();
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            return;
        };
        record.state = WorkerState::Draining;
        record.drain_deadline = Some(deadline);
        debug!(%id, "draining worker");
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.drain();
        }
    }

    /// Account a failed run and either schedule a respawn or halt the slot.
    fn on_slot_failure(
        &mut self,
        id: WorkerId,
        mut lineage: Lineage,
        code: Option<i32>,
        kind: ExitKind,
        now: Instant,
    ) {
        lineage.consecutive_crashes = lineage.consecutive_crashes.saturating_add(1);
        lineage.push_exit(ExitRecord { code, at: now, kind }, self.config.history_capacity());

        if matches!(self.phase, PoolPhase::Stopping | PoolPhase::Stopped) {
            return;
        }

        let crashes = self
            .breaker
            .crashes_in_window(&lineage.exit_history, now);
        if self.breaker.tripped(crashes) {
            let err = PoolError::CrashLoopDetected {
                id,
                crashes,
                window_ms: self.config.restart_window_ms,
            };
            error!(error = %err, "halting slot");
            #[cfg(feature = "metrics")]
            drover_core::metrics::counters().crash_loop();
            let aborts_reload = self
                .reload
                .as_ref()
                .is_some_and(|r| r.replacement == Some(id));
            self.degraded.push(DegradedSlot {
                last_id: id,
                crashes_in_window: crashes,
                last_exit_code: code,
                halted_at: now,
                surge: aborts_reload,
            });
            if aborts_reload {
                self.abort_reload(err, now);
            }
            return;
        }

        let delay = self.backoff.delay(lineage.consecutive_crashes);
        info!(
            %id,
            consecutive_crashes = lineage.consecutive_crashes,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "respawn scheduled"
        );
        self.respawns.push(PendingRespawn {
            previous_id: id,
            due: now + delay,
            lineage,
        });
    }

    fn abort_reload(&mut self, err: PoolError, now: Instant) {
        let Some(reload) = self.reload.take() else {
            return;
        };
        warn!(
            replaced = reload.replaced,
            remaining = reload.remaining.len(),
            "rolling reload aborted"
        );
        self.phase = PoolPhase::Running;
        self.finished.push((reload.command, Err(err)));
        self.reconcile(now);
    }

    fn enforce_drain_deadlines(&mut self, now: Instant) {
        let overdue: Vec<WorkerId> = self
            .records
            .iter()
            .filter(|r| r.state == WorkerState::Draining && !r.forced_kill)
            .filter(|r| r.drain_deadline.is_some_and(|d| d <= now))
            .map(|r| r.id)
            .collect();
        for id in overdue {
            warn!(%id, "worker outlived the graceful shutdown timeout, killing");
            if let Some(record) = self.record_mut(id) {
                record.forced_kill = true;
            }
            if let Some(handle) = self.handles.get_mut(&id) {
                handle.kill();
            }
            self.forced_kills_total += 1;
            #[cfg(feature = "metrics")]
            drover_core::metrics::counters().forced_kill();
            if let Some(stop) = self.stop.as_mut() {
                stop.forced_kills += 1;
            }
        }
    }

    fn reset_stable_crash_counters(&mut self, now: Instant) {
        let window = self.config.restart_window();
        for record in &mut self.records {
            if record.state != WorkerState::Ready || record.consecutive_crashes() == 0 {
                continue;
            }
            if record.ready_at.is_some_and(|at| at + window <= now) {
                debug!(id = %record.id, "worker stable for a full window, crash counter reset");
                record.lineage.consecutive_crashes = 0;
            }
        }
    }

    fn launch_due_respawns(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.respawns)
            .into_iter()
            .partition(|p| p.due <= now);
        self.respawns = waiting;
        for respawn in due {
            let id = self.allocate_worker_id();
            if let Some(reload) = self.reload.as_mut()
                && reload.replacement == Some(respawn.previous_id)
            {
                reload.replacement = Some(id);
            }
            info!(%id, previous_id = %respawn.previous_id, "respawning worker");
            self.restarts_total += 1;
            #[cfg(feature = "metrics")]
            drover_core::metrics::counters().restart();
            self.launch(id, respawn.lineage, now);
        }
    }

    // --- worker events ---

    fn on_event(&mut self, event: ControlCommand, now: Instant) -> Result<(), PoolError> {
        match event {
            ControlCommand::WorkerReady { id, endpoint } => {
                let record = self.record_mut(id).ok_or(PoolError::UnknownWorker(id))?;
                record.endpoint = Some(endpoint);
                record.last_heartbeat_at = Some(now);
                if record.state == WorkerState::Starting {
                    record.state = WorkerState::Ready;
                    record.ready_at = Some(now);
                    info!(%id, endpoint = ?record.endpoint, "worker ready");
                }
                Ok(())
            }
            ControlCommand::Heartbeat(id) => {
                let record = self.record_mut(id).ok_or(PoolError::UnknownWorker(id))?;
                record.last_heartbeat_at = Some(now);
                Ok(())
            }
            ControlCommand::WorkServed(id) => {
                let record = self.record_mut(id).ok_or(PoolError::UnknownWorker(id))?;
                record.last_heartbeat_at = Some(now);
                record.served += 1;
                Ok(())
            }
            ControlCommand::WorkerExited { id, code } => self.on_exit(id, code, now),
            ControlCommand::HeartbeatMissed(id) => self.on_heartbeat_missed(id, now),
            operator => {
                debug!(?operator, "operator command routed as event");
                Ok(())
            }
        }
    }

    fn on_exit(&mut self, id: WorkerId, code: Option<i32>, now: Instant) -> Result<(), PoolError> {
        let idx = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(PoolError::UnknownWorker(id))?;
        let record = self.records.remove(idx);
        self.handles.remove(&id);
        self.forget_for_reload(id);

        match record.state {
            WorkerState::Draining => {
                let kind = if record.forced_kill {
                    ExitKind::ForcedKill
                } else {
                    ExitKind::Graceful
                };
                info!(%id, ?code, ?kind, "worker exited");
            }
            WorkerState::Dead => {
                debug!(%id, ?code, "killed worker reaped");
            }
            WorkerState::Starting | WorkerState::Ready => {
                let err = PoolError::WorkerCrash { id, code };
                warn!(error = %err, state = %record.state, "worker crashed");
                self.on_slot_failure(id, record.lineage, code, ExitKind::Crash, now);
            }
        }
        Ok(())
    }

    fn on_heartbeat_missed(&mut self, id: WorkerId, now: Instant) -> Result<(), PoolError> {
        let record = self.record_mut(id).ok_or(PoolError::UnknownWorker(id))?;
        if !record.state.is_active() {
            return Ok(());
        }
        let err = PoolError::WorkerTimeout { id };
        warn!(error = %err, state = %record.state, "killing unresponsive worker");
        record.state = WorkerState::Dead;
        let lineage = record.lineage.clone();
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.kill();
        }
        self.forget_for_reload(id);
        self.on_slot_failure(id, lineage, None, ExitKind::Timeout, now);
        Ok(())
    }

    /// A pre-reload worker that is gone no longer needs replacing; a crashed
    /// replacement keeps its place through its pending respawn.
    fn forget_for_reload(&mut self, id: WorkerId) {
        if let Some(reload) = self.reload.as_mut() {
            reload.remaining.retain(|r| *r != id);
        }
    }

    // --- long-running operations ---

    /// Progress any in-flight stop or reload and run deferred commands once
    /// the pool settles.
    fn advance(&mut self, now: Instant) {
        loop {
            if let Some(stop) = self.stop.as_ref() {
                if !self.records.is_empty() {
                    return;
                }
                let outcome = CommandOutcome::Stopped {
                    forced_kills: stop.forced_kills,
                };
                info!(?outcome, "pool stopped");
                self.finished.push((stop.command, Ok(outcome)));
                self.stop = None;
                self.phase = PoolPhase::Stopped;
            }

            if self.reload.is_some() {
                self.progress_reload(now);
                if self.reload.is_some() {
                    return;
                }
            }

            let Some((id, command)) = self.deferred.pop_front() else {
                return;
            };
            debug!(%id, ?command, "running deferred command");
            if let Applied::Done(outcome) = self.execute(id, command, now) {
                self.finished.push((id, Ok(outcome)));
            }
        }
    }

    fn progress_reload(&mut self, now: Instant) {
        loop {
            let Some(reload) = self.reload.as_ref() else {
                return;
            };

            if let Some(replacement) = reload.replacement {
                let state = self.record(replacement).map(|r| r.state);
                let awaiting_respawn = self
                    .respawns
                    .iter()
                    .any(|p| p.previous_id == replacement);
                match state {
                    Some(WorkerState::Starting) => return,
                    Some(WorkerState::Ready) => {
                        let old = self.reload.as_mut().and_then(|r| {
                            r.replacement = None;
                            r.replaced += 1;
                            r.remaining.pop_front()
                        });
                        if let Some(old) = old {
                            self.begin_drain(old, now);
                        }
                        continue;
                    }
                    _ if awaiting_respawn => return,
                    _ => {
                        if let Some(r) = self.reload.as_mut() {
                            r.replacement = None;
                        }
                    }
                }
            }

            let still_running: Vec<WorkerId> = reload_remaining(self.reload.as_ref())
                .filter(|id| self.is_active(*id))
                .collect();
            if still_running.is_empty() {
                self.finish_reload(now);
                return;
            }

            let id = self.allocate_worker_id();
            if let Some(r) = self.reload.as_mut() {
                r.remaining = still_running.into();
                r.replacement = Some(id);
            }
            self.launch(id, Lineage::default(), now);
        }
    }

    fn finish_reload(&mut self, now: Instant) {
        let Some(reload) = self.reload.take() else {
            return;
        };
        self.phase = PoolPhase::Running;
        self.reconcile(now);
        info!(
            replaced = reload.replaced,
            generation = self.generation,
            "rolling reload complete"
        );
        self.finished.push((
            reload.command,
            Ok(CommandOutcome::Reloaded {
                replaced: reload.replaced,
                generation: self.generation,
            }),
        ));
    }
}

fn reload_remaining(reload: Option<&ReloadProgress>) -> impl Iterator<Item = WorkerId> + '_ {
    reload.into_iter().flat_map(|r| r.remaining.iter().copied())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::testing::FakeLauncher;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            desired_worker_count: workers,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            max_restarts_per_window: 3,
            restart_window_ms: 60_000,
            graceful_shutdown_timeout_ms: 10_000,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..PoolConfig::default()
        }
    }

    fn pool(workers: usize) -> (PoolManager<FakeLauncher>, Instant) {
        (PoolManager::new(config(workers), FakeLauncher::default()), Instant::now())
    }

    fn ids_in(pool: &PoolManager<FakeLauncher>, state: WorkerState) -> Vec<WorkerId> {
        pool.records()
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.id)
            .collect()
    }

    fn make_ready(pool: &mut PoolManager<FakeLauncher>, now: Instant) {
        for id in ids_in(pool, WorkerState::Starting) {
            pool.apply(
                ControlCommand::WorkerReady {
                    id,
                    endpoint: format!("127.0.0.1:{}", 4000 + id.get()),
                },
                now,
            )
            .unwrap();
        }
    }

    fn exit_draining(pool: &mut PoolManager<FakeLauncher>, now: Instant) {
        for id in ids_in(pool, WorkerState::Draining) {
            pool.apply(ControlCommand::WorkerExited { id, code: Some(0) }, now)
                .unwrap();
        }
    }

    fn started(workers: usize) -> (PoolManager<FakeLauncher>, Instant) {
        let (mut pool, now) = pool(workers);
        pool.apply(ControlCommand::Start, now).unwrap();
        make_ready(&mut pool, now);
        (pool, now)
    }

    #[test]
    fn new_pool_is_stopped_and_empty() {
        let (pool, now) = pool(3);
        assert_eq!(pool.phase(), PoolPhase::Stopped);
        assert!(pool.records().is_empty());
        assert_eq!(pool.status(now).desired_workers, 3);
        assert!(pool.next_deadline().is_none());
    }

    #[test]
    fn start_reaches_desired_ready_count() {
        for n in 0..=5 {
            let (pool, now) = started(n);
            assert_eq!(ids_in(&pool, WorkerState::Ready).len(), n);
            assert_eq!(pool.routes().len(), n);
            assert_eq!(pool.status(now).phase, PoolPhase::Running);
        }
    }

    #[test]
    fn start_is_idempotent() {
        let (mut pool, now) = started(2);
        let applied = pool.apply(ControlCommand::Start, now).unwrap();
        assert_eq!(
            applied,
            Applied::Done(CommandOutcome::Started { desired: 2 })
        );
        assert_eq!(pool.records().len(), 2);
        assert_eq!(pool.launcher().launched().len(), 2);
    }

    #[test]
    fn scale_grows_and_shrinks_oldest_first() {
        let (mut pool, now) = started(2);
        let applied = pool.apply(ControlCommand::Scale(4), now).unwrap();
        assert_eq!(applied, Applied::Done(CommandOutcome::Scaled { desired: 4 }));
        make_ready(&mut pool, now);
        assert_eq!(ids_in(&pool, WorkerState::Ready).len(), 4);

        pool.apply(ControlCommand::Scale(1), now).unwrap();
        let draining = ids_in(&pool, WorkerState::Draining);
        assert_eq!(draining, vec![WorkerId::new(1), WorkerId::new(2), WorkerId::new(3)]);
        assert_eq!(pool.launcher().drained(), draining);
        assert_eq!(ids_in(&pool, WorkerState::Ready), vec![WorkerId::new(4)]);
        // Draining workers are no longer dispatch targets.
        assert_eq!(pool.routes().len(), 1);
    }

    #[test]
    fn scale_to_zero_reports_nothing_after_drain() {
        let (mut pool, now) = started(3);
        // One crash leaves a pending respawn that scale-down must cancel.
        pool.apply(
            ControlCommand::WorkerExited {
                id: WorkerId::new(2),
                code: Some(1),
            },
            now,
        )
        .unwrap();
        assert_eq!(pool.status(now).pending_respawns.len(), 1);

        pool.apply(ControlCommand::Scale(0), now).unwrap();
        exit_draining(&mut pool, now);
        let status = pool.status(now);
        assert!(status.workers.is_empty());
        assert!(status.pending_respawns.is_empty());

        pool.tick(now + Duration::from_secs(5));
        assert!(pool.records().is_empty());
    }

    #[test]
    fn consecutive_scales_converge_to_the_last() {
        let (mut pool, now) = started(2);
        pool.apply(ControlCommand::Scale(5), now).unwrap();
        pool.apply(ControlCommand::Scale(3), now).unwrap();
        make_ready(&mut pool, now);
        exit_draining(&mut pool, now);
        assert_eq!(ids_in(&pool, WorkerState::Ready).len(), 3);
        assert_eq!(pool.records().len(), 3);
    }

    #[test]
    fn single_crash_respawns_once_and_leaves_siblings_alone() {
        let (mut pool, now) = started(3);
        let crashed = WorkerId::new(2);
        pool.apply(
            ControlCommand::WorkerExited {
                id: crashed,
                code: Some(101),
            },
            now,
        )
        .unwrap();
        assert_eq!(pool.records().len(), 2);
        assert_eq!(pool.next_deadline(), Some(now + Duration::from_millis(100)));

        // Not yet due.
        pool.tick(now + Duration::from_millis(50));
        assert_eq!(pool.launcher().launched().len(), 3);

        let later = now + Duration::from_millis(100);
        pool.tick(later);
        assert_eq!(pool.launcher().launched().len(), 4);
        let respawned = pool.record(WorkerId::new(4)).unwrap();
        assert_eq!(respawned.consecutive_crashes(), 1);
        assert_eq!(respawned.lineage.last_exit().unwrap().code, Some(101));
        assert_eq!(pool.status(later).total_restarts, 1);

        // Siblings untouched.
        assert!(pool.launcher().killed().is_empty());
        assert!(pool.launcher().drained().is_empty());
        assert_eq!(pool.record(WorkerId::new(1)).unwrap().state, WorkerState::Ready);
        assert_eq!(pool.record(WorkerId::new(3)).unwrap().state, WorkerState::Ready);
    }

    #[test]
    fn crash_loop_halts_slot_after_budget() {
        let (mut pool, mut now) = started(2);
        let mut victim = WorkerId::new(1);
        // Budget of 3 restarts: crashes 1..=3 respawn, the 4th halts.
        for crash in 1..=4 {
            pool.apply(
                ControlCommand::WorkerExited {
                    id: victim,
                    code: Some(1),
                },
                now,
            )
            .unwrap();
            if crash == 4 {
                break;
            }
            now = pool.next_deadline().unwrap();
            pool.tick(now);
            victim = *ids_in(&pool, WorkerState::Starting).last().unwrap();
        }
        let status = pool.status(now);
        assert!(status.is_degraded());
        assert_eq!(status.degraded[0].crashes_in_window, 4);
        assert_eq!(status.degraded[0].last_exit_code, Some(1));
        assert!(status.pending_respawns.is_empty());
        assert!(pool.next_deadline().is_none());
        // The healthy sibling keeps serving and the pool stays up.
        assert_eq!(status.phase, PoolPhase::Running);
        assert_eq!(ids_in(&pool, WorkerState::Ready), vec![WorkerId::new(2)]);

        // Start clears the mark and brings the slot back.
        pool.apply(ControlCommand::Start, now).unwrap();
        assert!(!pool.status(now).is_degraded());
        assert_eq!(pool.records().len(), 2);
    }

    #[test]
    fn backoff_grows_between_consecutive_crashes() {
        let (mut pool, mut now) = started(1);
        let mut delays = Vec::new();
        let mut victim = WorkerId::new(1);
        for _ in 0..3 {
            pool.apply(
                ControlCommand::WorkerExited {
                    id: victim,
                    code: Some(1),
                },
                now,
            )
            .unwrap();
            let due = pool.next_deadline().unwrap();
            delays.push(due - now);
            now = due;
            pool.tick(now);
            victim = ids_in(&pool, WorkerState::Starting)[0];
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn crash_counter_resets_after_a_stable_window() {
        let (mut pool, now) = started(1);
        pool.apply(
            ControlCommand::WorkerExited {
                id: WorkerId::new(1),
                code: Some(1),
            },
            now,
        )
        .unwrap();
        let respawn_at = now + Duration::from_millis(100);
        pool.tick(respawn_at);
        make_ready(&mut pool, respawn_at);
        let id = WorkerId::new(2);
        assert_eq!(pool.record(id).unwrap().consecutive_crashes(), 1);

        let reset_at = respawn_at + Duration::from_secs(60);
        assert_eq!(pool.next_deadline(), Some(reset_at));
        pool.tick(reset_at - Duration::from_millis(1));
        assert_eq!(pool.record(id).unwrap().consecutive_crashes(), 1);
        pool.tick(reset_at);
        assert_eq!(pool.record(id).unwrap().consecutive_crashes(), 0);
        assert!(pool.next_deadline().is_none());
    }

    #[test]
    fn crash_budget_is_restored_after_surviving_the_window() {
        let (mut pool, mut now) = started(1);
        let mut victim = WorkerId::new(1);
        for _ in 0..3 {
            pool.apply(
                ControlCommand::WorkerExited {
                    id: victim,
                    code: Some(1),
                },
                now,
            )
            .unwrap();
            now = pool.next_deadline().unwrap();
            pool.tick(now);
            victim = ids_in(&pool, WorkerState::Starting)[0];
        }
        // Three crashes fit the budget of three.
        assert!(!pool.status(now).is_degraded());
        make_ready(&mut pool, now);
        assert_eq!(pool.record(victim).unwrap().consecutive_crashes(), 3);

        let reset_at = now + Duration::from_secs(60);
        assert_eq!(pool.next_deadline(), Some(reset_at));
        pool.tick(reset_at);
        assert_eq!(pool.record(victim).unwrap().consecutive_crashes(), 0);

        let crash_at = reset_at + Duration::from_secs(1);
        pool.apply(
            ControlCommand::WorkerExited {
                id: victim,
                code: Some(1),
            },
            crash_at,
        )
        .unwrap();
        let status = pool.status(crash_at);
        assert!(status.degraded.is_empty());
        assert_eq!(status.pending_respawns.len(), 1);
        assert_eq!(status.pending_respawns[0].consecutive_crashes, 1);
        assert_eq!(
            pool.next_deadline(),
            Some(crash_at + Duration::from_millis(100))
        );
    }

    #[test]
    fn missed_heartbeat_kills_and_respawns() {
        let (mut pool, now) = started(2);
        let hung = WorkerId::new(1);
        pool.apply(ControlCommand::HeartbeatMissed(hung), now).unwrap();
        assert_eq!(pool.record(hung).unwrap().state, WorkerState::Dead);
        assert_eq!(pool.launcher().killed(), vec![hung]);
        assert_eq!(pool.routes().len(), 1);
        let status = pool.status(now);
        assert_eq!(status.pending_respawns.len(), 1);

        // The exit of a killed worker is not a second crash.
        pool.apply(ControlCommand::WorkerExited { id: hung, code: None }, now)
            .unwrap();
        assert!(pool.record(hung).is_none());
        let status = pool.status(now);
        assert_eq!(status.pending_respawns.len(), 1);
        assert_eq!(status.pending_respawns[0].consecutive_crashes, 1);
    }

    #[test]
    fn starting_worker_that_never_reports_ready_times_out() {
        let (mut pool, now) = pool(1);
        pool.apply(ControlCommand::Start, now).unwrap();
        let id = WorkerId::new(1);
        pool.apply(ControlCommand::HeartbeatMissed(id), now).unwrap();
        assert_eq!(pool.record(id).unwrap().state, WorkerState::Dead);
        assert_eq!(pool.status(now).pending_respawns.len(), 1);
    }

    #[test]
    fn launch_failures_count_as_crashes() {
        let (mut pool, mut now) = pool(1);
        pool.launcher().fail_next(10);
        pool.apply(ControlCommand::Start, now).unwrap();
        assert!(pool.records().is_empty());
        while let Some(due) = pool.next_deadline() {
            now = due;
            pool.tick(now);
        }
        let status = pool.status(now);
        assert!(status.is_degraded());
        assert_eq!(status.degraded[0].crashes_in_window, 4);
        assert_eq!(status.total_restarts, 3);
    }

    #[test]
    fn unknown_worker_events_are_rejected() {
        let (mut pool, now) = started(1);
        let ghost = WorkerId::new(99);
        assert_eq!(
            pool.apply(ControlCommand::Heartbeat(ghost), now),
            Err(PoolError::UnknownWorker(ghost))
        );
    }

    #[test]
    fn served_work_counts_as_liveness() {
        let (mut pool, now) = started(1);
        let id = WorkerId::new(1);
        let later = now + Duration::from_secs(3);
        pool.apply(ControlCommand::WorkServed(id), later).unwrap();
        let record = pool.record(id).unwrap();
        assert_eq!(record.served, 1);
        assert_eq!(record.last_heartbeat_at, Some(later));
    }

    #[test]
    fn stop_drains_everything_and_reports_forced_kills() {
        let (mut pool, now) = started(3);
        let Applied::Pending(cmd) = pool.apply(ControlCommand::Stop, now).unwrap() else {
            panic!("stop should be pending");
        };
        assert_eq!(pool.phase(), PoolPhase::Stopping);
        assert_eq!(pool.launcher().drained().len(), 3);
        assert!(pool.take_finished().is_empty());

        // Two exit promptly, the third ignores the drain request.
        for id in [WorkerId::new(1), WorkerId::new(2)] {
            pool.apply(ControlCommand::WorkerExited { id, code: Some(0) }, now)
                .unwrap();
        }
        let deadline = pool.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_secs(10));
        pool.tick(deadline);
        assert_eq!(pool.launcher().killed(), vec![WorkerId::new(3)]);
        assert!(pool.record(WorkerId::new(3)).unwrap().forced_kill);
        assert!(pool.take_finished().is_empty());

        pool.apply(
            ControlCommand::WorkerExited {
                id: WorkerId::new(3),
                code: None,
            },
            deadline,
        )
        .unwrap();
        assert_eq!(
            pool.take_finished(),
            vec![(cmd, Ok(CommandOutcome::Stopped { forced_kills: 1 }))]
        );
        let status = pool.status(deadline);
        assert_eq!(status.phase, PoolPhase::Stopped);
        assert_eq!(status.forced_kills, 1);
        assert!(status.pending_respawns.is_empty());
        // Forced kills during shutdown never count as crashes.
        assert_eq!(status.total_restarts, 0);
    }

    #[test]
    fn stop_of_an_empty_pool_finishes_immediately() {
        let (mut pool, now) = pool(2);
        let Applied::Pending(cmd) = pool.apply(ControlCommand::Stop, now).unwrap() else {
            panic!("stop should be pending");
        };
        assert_eq!(
            pool.take_finished(),
            vec![(cmd, Ok(CommandOutcome::Stopped { forced_kills: 0 }))]
        );
        assert_eq!(pool.phase(), PoolPhase::Stopped);
    }

    #[test]
    fn stop_cancels_respawns_and_waits_for_killed_workers() {
        let (mut pool, now) = started(2);
        let hung = WorkerId::new(1);
        pool.apply(ControlCommand::HeartbeatMissed(hung), now).unwrap();
        assert_eq!(pool.status(now).pending_respawns.len(), 1);

        pool.apply(ControlCommand::Stop, now).unwrap();
        assert!(pool.status(now).pending_respawns.is_empty());
        exit_draining(&mut pool, now);
        // The killed worker has not been reaped yet.
        assert_eq!(pool.phase(), PoolPhase::Stopping);
        assert!(pool.take_finished().is_empty());

        pool.apply(ControlCommand::WorkerExited { id: hung, code: None }, now)
            .unwrap();
        let status = pool.status(now);
        assert_eq!(status.phase, PoolPhase::Stopped);
        assert!(status.pending_respawns.is_empty());
        assert_eq!(pool.take_finished().len(), 1);
    }

    #[test]
    fn commands_wait_behind_a_stop() {
        let (mut pool, now) = started(1);
        let Applied::Pending(stop) = pool.apply(ControlCommand::Stop, now).unwrap() else {
            panic!("stop should be pending");
        };
        let Applied::Pending(start) = pool.apply(ControlCommand::Start, now).unwrap() else {
            panic!("start should be deferred");
        };
        assert_eq!(pool.status(now).queued_commands, 1);
        exit_draining(&mut pool, now);
        assert_eq!(
            pool.take_finished(),
            vec![
                (stop, Ok(CommandOutcome::Stopped { forced_kills: 0 })),
                (start, Ok(CommandOutcome::Started { desired: 1 })),
            ]
        );
        assert_eq!(pool.phase(), PoolPhase::Running);
        assert_eq!(ids_in(&pool, WorkerState::Starting).len(), 1);
    }

    #[test]
    fn rolling_reload_replaces_one_at_a_time() {
        for n in [3, 4] {
            rolling_reload(n);
        }
    }

    fn rolling_reload(n: usize) {
        let (mut pool, now) = started(n);
        let old: Vec<WorkerId> = ids_in(&pool, WorkerState::Ready);
        let Applied::Pending(cmd) = pool.apply(ControlCommand::Reload, now).unwrap() else {
            panic!("reload should be pending");
        };
        assert_eq!(pool.phase(), PoolPhase::Reloading);
        assert_eq!(pool.generation(), 2);

        let ready = |pool: &PoolManager<FakeLauncher>| ids_in(pool, WorkerState::Ready).len();
        for _ in 0..n {
            assert!(ready(&pool) >= n - 1);
            let starting = ids_in(&pool, WorkerState::Starting);
            assert_eq!(starting.len(), 1, "exactly one replacement at a time");
            make_ready(&mut pool, now);
            assert!(ready(&pool) >= n - 1);
            assert!(ids_in(&pool, WorkerState::Draining).len() <= 1);
            exit_draining(&mut pool, now);
        }
        assert_eq!(
            pool.take_finished(),
            vec![(
                cmd,
                Ok(CommandOutcome::Reloaded {
                    replaced: n,
                    generation: 2
                })
            )]
        );
        assert_eq!(pool.phase(), PoolPhase::Running);
        let ready = ids_in(&pool, WorkerState::Ready);
        assert_eq!(ready.len(), n);
        assert!(ready.iter().all(|id| !old.contains(id)));
        let first_new = u64::try_from(n).unwrap() + 1;
        let expected: Vec<WorkerId> = (first_new..first_new + u64::try_from(n).unwrap())
            .map(WorkerId::new)
            .collect();
        assert_eq!(ready, expected);
        assert!(pool.records().iter().all(|r| r.generation == 2));
        let launches = pool.launcher().launches();
        assert_eq!(launches.len(), 2 * n);
        assert!(launches[..n].iter().all(|spec| spec.generation == 1));
        assert!(launches[n..].iter().all(|spec| spec.generation == 2));
    }

    #[test]
    fn scale_during_reload_is_applied_after_it() {
        let (mut pool, now) = started(2);
        let Applied::Pending(reload) = pool.apply(ControlCommand::Restart, now).unwrap() else {
            panic!("reload should be pending");
        };
        let Applied::Pending(scale) = pool.apply(ControlCommand::Scale(4), now).unwrap() else {
            panic!("scale should be deferred");
        };
        for _ in 0..2 {
            make_ready(&mut pool, now);
            exit_draining(&mut pool, now);
        }
        let finished = pool.take_finished();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].0, reload);
        assert_eq!(finished[1], (scale, Ok(CommandOutcome::Scaled { desired: 4 })));
        make_ready(&mut pool, now);
        assert_eq!(ids_in(&pool, WorkerState::Ready).len(), 4);
    }

    #[test]
    fn old_worker_crashing_mid_reload_is_respawned_in_new_generation() {
        let (mut pool, now) = started(2);
        pool.apply(ControlCommand::Reload, now).unwrap();
        // Worker 2 is still waiting to be replaced when it crashes.
        pool.apply(
            ControlCommand::WorkerExited {
                id: WorkerId::new(2),
                code: Some(1),
            },
            now,
        )
        .unwrap();
        make_ready(&mut pool, now);
        exit_draining(&mut pool, now);
        let later = pool.next_deadline().unwrap();
        pool.tick(later);
        make_ready(&mut pool, later);

        let finished = pool.take_finished();
        assert!(matches!(
            finished.as_slice(),
            [(_, Ok(CommandOutcome::Reloaded { replaced: 1, generation: 2 }))]
        ));
        assert_eq!(ids_in(&pool, WorkerState::Ready).len(), 2);
        assert!(pool.records().iter().all(|r| r.generation == 2));
    }

    #[test]
    fn reload_aborts_when_replacement_crash_loops() {
        let (mut pool, mut now) = started(2);
        let Applied::Pending(cmd) = pool.apply(ControlCommand::Reload, now).unwrap() else {
            panic!("reload should be pending");
        };
        for _ in 0..4 {
            let replacement = ids_in(&pool, WorkerState::Starting)[0];
            pool.apply(
                ControlCommand::WorkerExited {
                    id: replacement,
                    code: Some(2),
                },
                now,
            )
            .unwrap();
            if let Some(due) = pool.next_deadline() {
                now = due;
                pool.tick(now);
            }
        }
        let finished = pool.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, cmd);
        assert!(matches!(
            finished[0].1,
            Err(PoolError::CrashLoopDetected { crashes: 4, .. })
        ));
        // Old workers keep serving.
        assert_eq!(pool.phase(), PoolPhase::Running);
        assert_eq!(
            ids_in(&pool, WorkerState::Ready),
            vec![WorkerId::new(1), WorkerId::new(2)]
        );
    }

    #[test]
    fn reload_of_an_empty_pool_completes_immediately() {
        let (mut pool, now) = started(0);
        let Applied::Pending(cmd) = pool.apply(ControlCommand::Reload, now).unwrap() else {
            panic!("reload should be pending");
        };
        assert_eq!(
            pool.take_finished(),
            vec![(
                cmd,
                Ok(CommandOutcome::Reloaded {
                    replaced: 0,
                    generation: 2
                })
            )]
        );
        assert_eq!(pool.phase(), PoolPhase::Running);
    }

    #[test]
    fn status_reflects_in_flight_reload() {
        let (mut pool, now) = started(2);
        pool.apply(ControlCommand::Reload, now).unwrap();
        pool.apply(ControlCommand::Scale(1), now).unwrap();
        let status = pool.status(now);
        assert_eq!(status.phase, PoolPhase::Reloading);
        assert_eq!(status.generation, 2);
        assert_eq!(status.count_in(WorkerState::Starting), 1);
        assert_eq!(status.count_in(WorkerState::Ready), 2);
        assert_eq!(status.queued_commands, 1);
    }
}
