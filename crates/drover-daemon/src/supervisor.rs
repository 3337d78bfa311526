//! The supervisor task.
//!
//! One task owns the [`PoolManager`] and the [`HealthMonitor`]. Operator
//! commands, worker events and status queries all arrive on a single queue
//! and are applied one at a time; the only other wake-up source is the next
//! pool or liveness deadline. After every step the Ready routes and a status
//! snapshot are republished on watch channels.

use std::collections::HashMap;

use drover_core::PoolConfig;
use drover_core::protocol::CommandOutcome;
use drover_core::status::PoolStatus;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::dispatch::Route;
use crate::error::PoolError;
use crate::health::HealthMonitor;
use crate::pool::{Applied, CommandId, ControlCommand, PoolManager};
use crate::process::Launcher;

/// Queue depth between producers and the supervisor task.
pub const QUEUE_CAPACITY: usize = 1024;

pub type Reply = oneshot::Sender<Result<CommandOutcome, PoolError>>;

/// A message for the supervisor task.
#[derive(Debug)]
pub enum Envelope {
    /// Operator command, answered once it completes.
    Command {
        command: ControlCommand,
        reply: Option<Reply>,
    },
    /// Worker event from a launcher task.
    Event(ControlCommand),
    Status(oneshot::Sender<PoolStatus>),
    /// Leave the loop. Workers are not touched; stop the pool first.
    Shutdown,
}

/// Create the supervisor queue. The sender goes to the launcher as well as
/// the handle, so it must exist before the supervisor.
pub fn channel() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
    mpsc::channel(QUEUE_CAPACITY)
}

enum Wake {
    Message(Envelope),
    Timer,
    Closed,
}

pub struct Supervisor<L: Launcher> {
    pool: PoolManager<L>,
    monitor: HealthMonitor,
    rx: mpsc::Receiver<Envelope>,
    routes: watch::Sender<Vec<Route>>,
    status: watch::Sender<PoolStatus>,
    waiting: HashMap<CommandId, Reply>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        config: &PoolConfig,
        launcher: L,
        tx: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
    ) -> (Self, SupervisorHandle) {
        let pool = PoolManager::new(config.clone(), launcher);
        let monitor = HealthMonitor::new(config.heartbeat_interval(), config.heartbeat_timeout());
        let (routes, routes_rx) = watch::channel(Vec::new());
        let (status, status_rx) = watch::channel(pool.status(Instant::now()));
        let supervisor = Self {
            pool,
            monitor,
            rx,
            routes,
            status,
            waiting: HashMap::new(),
        };
        let handle = SupervisorHandle {
            tx,
            status: status_rx,
            routes: routes_rx,
        };
        (supervisor, handle)
    }

    /// Run until [`Envelope::Shutdown`] arrives or every sender is gone.
    pub async fn run(mut self) {
        info!(desired = self.pool.desired(), "supervisor started");
        loop {
            let wake = match self.next_deadline() {
                Some(at) => tokio::select! {
                    msg = self.rx.recv() => msg.map_or(Wake::Closed, Wake::Message),
                    () = tokio::time::sleep_until(at) => Wake::Timer,
                },
                None => self.rx.recv().await.map_or(Wake::Closed, Wake::Message),
            };
            let now = Instant::now();
            match wake {
                Wake::Message(Envelope::Shutdown) | Wake::Closed => break,
                Wake::Message(envelope) => self.handle(envelope, now),
                Wake::Timer => {}
            }
            self.on_timers(now);
            self.resolve_finished();
            self.publish(now);
        }
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(PoolError::ShuttingDown));
        }
        info!("supervisor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let liveness = self.monitor.next_check(self.pool.records());
        [self.pool.next_deadline(), liveness].into_iter().flatten().min()
    }

    fn handle(&mut self, envelope: Envelope, now: Instant) {
        match envelope {
            Envelope::Command { command, reply } => match self.pool.apply(command, now) {
                Ok(Applied::Done(outcome)) => respond(reply, Ok(outcome)),
                Ok(Applied::Pending(id)) => {
                    if let Some(reply) = reply {
                        self.waiting.insert(id, reply);
                    }
                }
                Ok(Applied::Event) => {}
                Err(e) => respond(reply, Err(e)),
            },
            Envelope::Event(event) => {
                if let Err(e) = self.pool.apply(event, now) {
                    debug!(error = %e, "dropping stale worker event");
                }
            }
            Envelope::Status(reply) => {
                let _ = reply.send(self.pool.status(now));
            }
            Envelope::Shutdown => {}
        }
    }

    fn on_timers(&mut self, now: Instant) {
        self.pool.tick(now);
        for id in self.monitor.overdue(self.pool.records(), now) {
            if let Err(e) = self.pool.apply(ControlCommand::HeartbeatMissed(id), now) {
                debug!(%id, error = %e, "liveness verdict for a vanished worker");
            }
        }
    }

    fn resolve_finished(&mut self) {
        for (id, result) in self.pool.take_finished() {
            if let Some(reply) = self.waiting.remove(&id) {
                let _ = reply.send(result);
            } else {
                debug!(%id, ?result, "command finished with nobody waiting");
            }
        }
    }

    fn publish(&self, now: Instant) {
        let routes = self.pool.routes();
        self.routes.send_if_modified(|current| {
            if *current == routes {
                false
            } else {
                *current = routes;
                true
            }
        });
        self.status.send_replace(self.pool.status(now));
    }
}

fn respond(reply: Option<Reply>, result: Result<CommandOutcome, PoolError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

/// Cloneable access to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Envelope>,
    status: watch::Receiver<PoolStatus>,
    routes: watch::Receiver<Vec<Route>>,
}

impl SupervisorHandle {
    /// Submit an operator command and wait for it to complete.
    pub async fn submit(&self, command: ControlCommand) -> Result<CommandOutcome, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Command {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        rx.await.map_err(|_| PoolError::ShuttingDown)?
    }

    /// Current pool status, read by the supervisor task itself. Falls back to
    /// the last published snapshot once the task is gone.
    pub async fn status(&self) -> PoolStatus {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Envelope::Status(reply)).await.is_ok()
            && let Ok(status) = rx.await
        {
            return status;
        }
        self.latest_status()
    }

    /// Last published status snapshot.
    pub fn latest_status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn routes(&self) -> watch::Receiver<Vec<Route>> {
        self.routes.clone()
    }

    /// Sender for worker events, for launchers created after the handle.
    pub fn events(&self) -> mpsc::Sender<Envelope> {
        self.tx.clone()
    }

    /// Ask the supervisor loop to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Envelope::Shutdown).await;
    }
}
