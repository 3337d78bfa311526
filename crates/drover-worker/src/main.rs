//! `drover-fib-worker`
//!
//! Demo worker: answers each request line `n` with the `n`th Fibonacci
//! number, computed the slow way.

use clap::Parser;
use drover_core::tracing_init::{LogTarget, init_tracing};
use drover_worker::fib::{DEFAULT_MAX_N, Fibonacci, MAX_N};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "drover-fib-worker")]
#[command(version, about = "drover demo worker - CPU-bound Fibonacci")]
struct Args {
    /// Largest `n` accepted per request (at most 93, the last that fits a u64)
    #[arg(
        long,
        env = "DROVER_FIB_MAX_N",
        default_value_t = DEFAULT_MAX_N,
        value_parser = clap::value_parser!(u32).range(..=i64::from(MAX_N))
    )]
    max_n: u32,

    /// Log level filter (logs go to stderr)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &format!("drover_worker={0},drover_fib_worker={0}", args.log_level),
        args.log_json,
        LogTarget::Stderr,
    );
    info!(max_n = args.max_n, "Starting drover-fib-worker");
    drover_worker::run(Fibonacci::new(args.max_n)).await?;
    Ok(())
}
