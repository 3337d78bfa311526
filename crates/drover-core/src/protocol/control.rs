//! Control socket messages.
//!
//! One request line per connection, answered by one response line.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::status::PoolStatus;

/// Operator request sent by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Start,
    Stop,
    /// Rolling reload of every worker.
    Restart,
    Scale { workers: usize },
    Status,
}

/// Result of a completed operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutcome {
    Started { desired: usize },
    Stopped { forced_kills: u32 },
    Reloaded { replaced: usize, generation: u64 },
    Scaled { desired: usize },
}

/// Daemon response to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok { outcome: CommandOutcome },
    Status { status: PoolStatus },
    Error { message: String },
}

/// Encode a message as one NDJSON line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one NDJSON line.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::NdjsonParse("empty line".into()));
    }
    Ok(serde_json::from_str(trimmed)?)
}
