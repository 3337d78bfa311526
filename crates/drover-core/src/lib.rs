//! `drover` Core Library
//!
//! Shared functionality for `drover` components:
//! - Pool and daemon configuration with hierarchical resolution
//! - NDJSON wire protocol between the supervisor, its workers and the CLI
//! - Status views and table rendering
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod protocol;
pub mod status;
pub mod tracing_init;

pub use config::{BackoffStrategy, Config, DaemonConfig, PoolConfig};
pub use error::{Error, Result};
pub use status::{PoolPhase, PoolStatus, WorkerState, WorkerStatus};
