use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use drover_core::protocol::{
    ENV_GENERATION, ENV_HEARTBEAT_INTERVAL_MS, ENV_WORKER_ID, WorkerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{Handler, WorkerError};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Identity and timing handed down by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_id: u64,
    pub generation: u64,
    pub heartbeat_interval: Duration,
    /// Private endpoint; port 0 picks a free one.
    pub bind_addr: SocketAddr,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: 0,
            generation: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Missing variables
    /// keep their defaults so a worker can also be run by hand.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>, WorkerError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| WorkerError::Env(format!("{key}={raw:?}: {e}")))
                })
                .transpose()
        };
        let mut settings = Self::default();
        if let Some(id) = parse(ENV_WORKER_ID)? {
            settings.worker_id = id;
        }
        if let Some(generation) = parse(ENV_GENERATION)? {
            settings.generation = generation;
        }
        if let Some(ms) = parse(ENV_HEARTBEAT_INTERVAL_MS)? {
            if ms == 0 {
                return Err(WorkerError::Env(format!("{ENV_HEARTBEAT_INTERVAL_MS} must be > 0")));
            }
            settings.heartbeat_interval = Duration::from_millis(ms);
        }
        Ok(settings)
    }
}

/// Writer task turning messages into NDJSON lines on stdout.
pub fn stdout_sink() -> (mpsc::Sender<WorkerMessage>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(64);
    let task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let mut line = message.to_line();
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                warn!(error = %e, "stdout closed");
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });
    (tx, task)
}

/// Run a worker under the supervisor: settings from the environment,
/// protocol messages on stdout, graceful drain on SIGTERM or Ctrl+C.
pub async fn run<H: Handler>(handler: H) -> Result<(), WorkerError> {
    let settings = WorkerSettings::from_env()?;
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone())?;
    let (events, writer) = stdout_sink();
    let result = serve(settings, Arc::new(handler), events, shutdown).await;
    let _ = writer.await;
    result
}

#[cfg(unix)]
fn spawn_signal_listener(shutdown: CancellationToken) -> Result<(), WorkerError> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, draining"),
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, draining"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: CancellationToken) -> Result<(), WorkerError> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, draining");
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Serve until `shutdown` fires, then wait for in-flight requests.
///
/// Protocol messages go to `events`; the caller decides where they are
/// written.
pub async fn serve<H: Handler>(
    settings: WorkerSettings,
    handler: Arc<H>,
    events: mpsc::Sender<WorkerMessage>,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let listener = TcpListener::bind(settings.bind_addr).await?;
    let endpoint = listener.local_addr()?.to_string();
    info!(
        worker_id = settings.worker_id,
        generation = settings.generation,
        %endpoint,
        "worker listening"
    );
    let _ = events.send(WorkerMessage::Ready { endpoint }).await;

    let heartbeat = tokio::spawn(heartbeat_loop(
        settings.heartbeat_interval,
        events.clone(),
        shutdown.clone(),
    ));

    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    connections.spawn(serve_connection(
                        stream,
                        Arc::clone(&handler),
                        events.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    drop(listener);

    info!(in_flight = connections.len(), "draining");
    connections.close();
    connections.wait().await;
    let _ = heartbeat.await;
    info!("worker drained");
    Ok(())
}

async fn heartbeat_loop(
    period: Duration,
    events: mpsc::Sender<WorkerMessage>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; readiness already counts.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if events.send(WorkerMessage::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// One response line per request line. Between requests the connection
/// notices shutdown and closes; a request already read is always answered.
async fn serve_connection<H: Handler>(
    stream: TcpStream,
    handler: Arc<H>,
    events: mpsc::Sender<WorkerMessage>,
    shutdown: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let request = match line {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        };
        let worker = Arc::clone(&handler);
        let reply = match tokio::task::spawn_blocking(move || worker.handle(&request)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => format!("ERR {e}"),
            Err(e) => format!("ERR handler failed: {e}"),
        };
        if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
            break;
        }
        let _ = events.send(WorkerMessage::Served).await;
    }
}
