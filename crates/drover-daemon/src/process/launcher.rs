//! Launches workers as OS processes.

use std::process::Stdio;
use std::time::Duration;

use drover_core::PoolConfig;
use drover_core::protocol::{
    ENV_GENERATION, ENV_HEARTBEAT_INTERVAL_MS, ENV_WORKER_ID, WorkerMessage, parse_worker_line,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{LaunchSpec, Launcher, WorkerHandle, terminate_child};
use crate::error::PoolError;
use crate::pool::{ControlCommand, WorkerId};
use crate::supervisor::Envelope;

/// How long an exit waits for the worker's remaining stdout to be forwarded.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns the configured worker command once per worker.
///
/// Each launch starts three tasks: one turning stdout NDJSON into pool
/// events, one forwarding stderr to the log, and one waiting for the exit.
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    heartbeat_interval_ms: u64,
    events: mpsc::Sender<Envelope>,
}

impl ProcessLauncher {
    pub fn new(
        command: &[String],
        config: &PoolConfig,
        events: mpsc::Sender<Envelope>,
    ) -> Result<Self, PoolError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PoolError::Config("worker command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            events,
        })
    }
}

impl Launcher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&mut self, spec: LaunchSpec) -> Result<ProcessHandle, PoolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_WORKER_ID, spec.id.to_string())
            .env(ENV_GENERATION, spec.generation.to_string())
            .env(ENV_HEARTBEAT_INTERVAL_MS, self.heartbeat_interval_ms.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PoolError::Launch {
            id: spec.id,
            reason: format!("{}: {e}", self.program),
        })?;
        let pid = child.id();
        info!(id = %spec.id, ?pid, generation = spec.generation, program = %self.program, "spawned worker process");

        let stdout = child.stdout.take().ok_or_else(|| PoolError::Launch {
            id: spec.id,
            reason: "failed to capture stdout".into(),
        })?;
        let reader = tokio::spawn(forward_stdout(spec.id, stdout, self.events.clone()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.id, stderr));
        }

        let (requests, inbox) = mpsc::unbounded_channel();
        tokio::spawn(monitor(spec.id, child, inbox, reader, self.events.clone()));

        Ok(ProcessHandle {
            id: spec.id,
            pid,
            requests,
        })
    }
}

/// What the pool asks of a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Drain,
    Kill,
}

/// Owns the child until it exits. Signals are only sent from here, while
/// the child is still unreaped, so a recycled pid is never targeted.
async fn monitor(
    id: WorkerId,
    mut child: Child,
    mut inbox: mpsc::UnboundedReceiver<Request>,
    reader: tokio::task::JoinHandle<()>,
    events: mpsc::Sender<Envelope>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = inbox.recv() => match request {
                Some(Request::Drain) => match terminate_child(&mut child) {
                    Ok(true) => debug!(%id, "sent SIGTERM"),
                    Ok(false) => debug!(%id, "worker already exited, drain skipped"),
                    Err(e) => warn!(%id, error = %e, "failed to send SIGTERM"),
                },
                // A dropped handle kills the worker too.
                Some(Request::Kill) | None => {
                    if let Err(e) = child.start_kill() {
                        warn!(%id, error = %e, "failed to kill worker");
                    }
                    break child.wait().await;
                }
            },
        }
    };
    // Deliver everything the worker printed before its exit.
    let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await;
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(%id, error = %e, "failed to wait for worker");
            None
        }
    };
    debug!(%id, ?code, "worker process exited");
    let _ = events
        .send(Envelope::Event(ControlCommand::WorkerExited { id, code }))
        .await;
}

async fn forward_stdout(id: WorkerId, stdout: ChildStdout, events: mpsc::Sender<Envelope>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let event = match parse_worker_line(&line) {
            Ok(WorkerMessage::Ready { endpoint }) => ControlCommand::WorkerReady { id, endpoint },
            Ok(WorkerMessage::Heartbeat) => ControlCommand::Heartbeat(id),
            Ok(WorkerMessage::Served) => ControlCommand::WorkServed(id),
            Ok(WorkerMessage::Unknown { msg_type }) => {
                debug!(%id, msg_type, "ignoring unknown worker message");
                continue;
            }
            Err(e) => {
                debug!(%id, error = %e, line = %line, "ignoring malformed worker output");
                continue;
            }
        };
        if events.send(Envelope::Event(event)).await.is_err() {
            break;
        }
    }
}

async fn forward_stderr(id: WorkerId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(%id, "stderr: {}", line);
    }
}

/// Handle to a spawned worker process. Requests go to the task that owns
/// the child; once it has exited they are ignored.
#[derive(Debug)]
pub struct ProcessHandle {
    id: WorkerId,
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<Request>,
}

impl ProcessHandle {
    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            debug!(id = %self.id, ?request, "worker already gone");
        }
    }
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn drain(&mut self) {
        self.request(Request::Drain);
    }

    fn kill(&mut self) {
        self.request(Request::Kill);
    }
}
