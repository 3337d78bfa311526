//! `drover` worker runtime.
//!
//! A worker is a process started by the drover supervisor. The runtime
//! takes care of the supervisor side of the contract so a worker only has to
//! implement [`Handler`]:
//! - bind a private endpoint and announce it on stdout
//! - send heartbeats on the interval the supervisor asks for
//! - serve line-oriented requests, one response line per request
//! - on SIGTERM, stop accepting, finish in-flight requests and exit cleanly

pub mod fib;
mod runtime;

pub use runtime::{WorkerSettings, run, serve, stdout_sink};

use thiserror::Error;

/// Application logic run for every request line.
///
/// Handlers run on the blocking thread pool, so CPU-bound work does not
/// stall heartbeats or other connections.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &str) -> Result<String, HandlerError>;
}

/// A request the handler could not serve. Sent back as `ERR <message>`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid environment: {0}")]
    Env(String),
}
