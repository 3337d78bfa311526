//! `drover` daemon
//!
//! Supervises a pool of worker processes, dispatches incoming connections
//! across the ready ones and serves the control socket used by `drover`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use drover_core::config::load_config;
use drover_core::protocol::CommandOutcome;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(unix)]
use drover_daemon::control::ControlServer;
use drover_daemon::dispatch::DispatchService;
use drover_daemon::pool::ControlCommand;
use drover_daemon::process::ProcessLauncher;
use drover_daemon::supervisor::{self, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "drover-daemon")]
#[command(version, about = "drover daemon - worker pool supervisor")]
struct Args {
    /// Configuration file (TOML), layered over the global config file
    #[arg(long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Public address connections are accepted on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Control socket path
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Desired number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Milliseconds without a heartbeat before a worker is considered hung
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Milliseconds a draining worker gets before it is killed
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long)]
    log_json: bool,

    /// Do not start workers until `drover start`
    #[arg(long)]
    idle: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "DROVER_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    /// Worker command and arguments, after `--`
    #[arg(last = true)]
    worker_command: Vec<String>,
}

impl Args {
    fn apply(&self, config: &mut drover_core::Config) {
        if let Some(listen) = self.listen {
            config.daemon.listen_addr = listen.to_string();
        }
        if let Some(path) = &self.control_socket {
            config.daemon.control_socket.clone_from(path);
        }
        if let Some(workers) = self.workers {
            config.pool.desired_worker_count = workers;
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.pool.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            config.pool.graceful_shutdown_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
        if self.log_json {
            config.daemon.log_json = true;
        }
        if !self.worker_command.is_empty() {
            config.daemon.worker_command.clone_from(&self.worker_command);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!(
        "drover_daemon={0},drover_core={0}",
        config.daemon.log_level
    );
    let _metrics_guard = drover_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        config.daemon.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.daemon.listen_addr,
        workers = config.pool.desired_worker_count,
        command = ?config.daemon.worker_command,
        "Starting drover-daemon"
    );

    let listen = config.daemon.listen_socket_addr()?;
    let dispatch = DispatchService::bind(listen, &config.pool).await?;
    #[cfg(unix)]
    let control = ControlServer::bind(&config.daemon.control_socket)?;

    let (tx, rx) = supervisor::channel();
    let launcher = ProcessLauncher::new(&config.daemon.worker_command, &config.pool, tx.clone())?;
    let (supervisor, handle) = Supervisor::new(&config.pool, launcher, tx, rx);
    let supervisor_task = tokio::spawn(supervisor.run());

    let shutdown = CancellationToken::new();
    let dispatch_task = tokio::spawn(dispatch.run(handle.routes(), shutdown.clone()));
    #[cfg(unix)]
    let control_task = tokio::spawn(control.run(handle.clone(), shutdown.clone()));
    #[cfg(not(unix))]
    let control_task = tokio::spawn(async {});

    if args.idle {
        info!("Idle start, waiting for `drover start`");
    } else {
        handle.submit(ControlCommand::Start).await?;
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so workers don't accidentally notify
    // systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %listen, "drover-daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    let stopped = handle.submit(ControlCommand::Stop).await;
    shutdown.cancel();
    handle.shutdown().await;
    let _ = tokio::join!(dispatch_task, control_task, supervisor_task);

    match stopped {
        Ok(CommandOutcome::Stopped { forced_kills: 0 }) => {
            info!("Daemon stopped");
            Ok(ExitCode::SUCCESS)
        }
        Ok(CommandOutcome::Stopped { forced_kills }) => {
            warn!(forced_kills, "Daemon stopped, some workers had to be killed");
            Ok(ExitCode::from(2))
        }
        Ok(other) => {
            warn!(?other, "Unexpected stop outcome");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!(error = %e, "Stop failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn timeout_flags_are_milliseconds() {
        let args = Args::try_parse_from([
            "drover-daemon",
            "--heartbeat-timeout-ms",
            "2500",
            "--shutdown-timeout-ms",
            "750",
            "--",
            "worker",
            "--flag",
        ])
        .ok();
        let Some(args) = args else {
            panic!("flags should parse");
        };
        let mut config = drover_core::Config::default();
        args.apply(&mut config);
        assert_eq!(config.pool.heartbeat_timeout_ms, 2_500);
        assert_eq!(config.pool.graceful_shutdown_timeout_ms, 750);
        assert_eq!(config.daemon.worker_command, vec!["worker", "--flag"]);
    }
}
