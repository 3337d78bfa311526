//! `drover` CLI
//!
//! Operator front end for a running `drover-daemon`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drover_core::config::default_control_socket;
use drover_core::protocol::ControlRequest;
use drover_core::status::render_table;
use drover_core::tracing_init::{LogTarget, init_tracing};
use drover_cli::client::ControlClient;
use drover_cli::output::{describe, exit_code};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about = "Control a drover worker pool", long_about = None)]
struct Cli {
    /// Daemon control socket
    #[arg(long, env = "DROVER_CONTROL_SOCKET")]
    socket: Option<PathBuf>,

    /// Give up after this many seconds (default: wait for the pool to settle)
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the pool at its configured size
    Start,
    /// Drain every worker and stop the pool
    Stop,
    /// Rolling reload: replace every worker with a fresh one
    Restart,
    /// Change the desired worker count
    Scale {
        /// New desired worker count
        workers: usize,
    },
    /// Show pool and per-worker status
    Status {
        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[allow(clippy::print_stderr)]
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing("drover_cli=warn", false, LogTarget::Stderr);

    let mut client = ControlClient::new(cli.socket.unwrap_or_else(default_control_socket));
    if let Some(secs) = cli.timeout {
        client = client.with_timeout(Duration::from_secs(secs));
    }

    match run(&client, cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("drover: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::print_stdout)]
async fn run(client: &ControlClient, command: Command) -> anyhow::Result<u8> {
    let request = match command {
        Command::Status { json } => {
            let status = client.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_table(&status));
            }
            return Ok(0);
        }
        Command::Start => ControlRequest::Start,
        Command::Stop => ControlRequest::Stop,
        Command::Restart => ControlRequest::Restart,
        Command::Scale { workers } => ControlRequest::Scale { workers },
    };
    let outcome = client.command(&request).await?;
    println!("{}", describe(&outcome));
    Ok(exit_code(&outcome))
}
