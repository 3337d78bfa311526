//! NDJSON wire protocol.
//!
//! Two line-delimited JSON streams cross process boundaries:
//! - worker stdout, carrying readiness and liveness events to the supervisor
//! - the control socket, carrying operator requests and their responses

mod control;
mod worker;

pub use control::{CommandOutcome, ControlRequest, ControlResponse, decode, encode};
pub use worker::{WorkerMessage, parse_worker_line};

/// Environment variable carrying the worker's id.
pub const ENV_WORKER_ID: &str = "DROVER_WORKER_ID";
/// Environment variable carrying the worker's pool generation.
pub const ENV_GENERATION: &str = "DROVER_GENERATION";
/// Environment variable carrying the heartbeat interval in milliseconds.
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "DROVER_HEARTBEAT_INTERVAL_MS";
