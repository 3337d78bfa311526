//! `drover` daemon library.
//!
//! The daemon supervises a pool of worker processes, dispatches incoming
//! connections across the ready workers and exposes a control socket for the
//! `drover` CLI.
//!
//! - [`pool`]: the worker lifecycle state machine, backoff and crash-loop policy
//! - [`health`]: heartbeat-based liveness verdicts
//! - [`dispatch`]: round-robin connection dispatch and the proxy listener
//! - [`process`]: launching worker OS processes and monitoring their output
//! - [`supervisor`]: the single task that owns the pool and serialises commands
//! - [`control`]: the operator control socket

#[cfg(unix)]
pub mod control;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod pool;
pub mod process;
pub mod supervisor;

pub use error::PoolError;
