//! Worker pool: records, commands, backoff policy and the lifecycle state
//! machine.

mod backoff;
mod command;
mod manager;
mod record;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{BackoffPolicy, CrashLoopBreaker};
pub use command::{Applied, CommandId, ControlCommand};
pub use manager::PoolManager;
pub use record::{ExitKind, ExitRecord, Lineage, WorkerId, WorkerRecord};
