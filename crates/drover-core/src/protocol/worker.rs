//! Worker → supervisor messages.
//!
//! Implements the tolerant reader pattern: unknown fields are ignored and
//! unknown message types are surfaced as [`WorkerMessage::Unknown`] so a newer
//! worker never crashes an older supervisor.

use serde_json::{Value, json};

use crate::error::{Error, Result};

/// A message a worker writes to its stdout, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// The worker is listening on `endpoint` and accepts dispatched work.
    Ready { endpoint: String },
    /// Periodic liveness signal, independent of request volume.
    Heartbeat,
    /// One unit of work completed. Also counts as liveness.
    Served,
    Unknown { msg_type: String },
}

impl WorkerMessage {
    /// Encode as a single NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> String {
        let value = match self {
            Self::Ready { endpoint } => json!({ "type": "ready", "endpoint": endpoint }),
            Self::Heartbeat => json!({ "type": "heartbeat" }),
            Self::Served => json!({ "type": "served" }),
            Self::Unknown { msg_type } => json!({ "type": msg_type }),
        };
        value.to_string()
    }
}

/// Parse a single NDJSON line from a worker's stdout.
pub fn parse_worker_line(line: &str) -> Result<WorkerMessage> {
    let raw: Value = serde_json::from_str(line.trim())?;
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "ready" => {
            let endpoint = raw
                .get("endpoint")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::NdjsonParse("ready message without endpoint".into()))?;
            Ok(WorkerMessage::Ready {
                endpoint: endpoint.to_string(),
            })
        }
        "heartbeat" => Ok(WorkerMessage::Heartbeat),
        "served" => Ok(WorkerMessage::Served),
        other => Ok(WorkerMessage::Unknown {
            msg_type: other.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_ready() {
        let msg = parse_worker_line(r#"{"type":"ready","endpoint":"127.0.0.1:4100"}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Ready {
                endpoint: "127.0.0.1:4100".into()
            }
        );
    }

    #[test]
    fn ready_requires_endpoint() {
        assert!(parse_worker_line(r#"{"type":"ready"}"#).is_err());
        assert!(parse_worker_line(r#"{"type":"ready","endpoint":""}"#).is_err());
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let msg = parse_worker_line(r#"{"type":"heartbeat","load":0.3}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Heartbeat);
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let msg = parse_worker_line(r#"{"type":"gc_pause","ms":12}"#).unwrap();
        assert!(matches!(msg, WorkerMessage::Unknown { msg_type } if msg_type == "gc_pause"));
    }

    #[test]
    fn plain_text_is_an_error() {
        assert!(parse_worker_line("listening on 4100").is_err());
        assert!(parse_worker_line(r#"{"kind":"ready"}"#).is_err());
    }

    #[test]
    fn emitted_lines_parse_back() {
        for msg in [
            WorkerMessage::Ready {
                endpoint: "[::1]:9".into(),
            },
            WorkerMessage::Heartbeat,
            WorkerMessage::Served,
        ] {
            assert_eq!(parse_worker_line(&msg.to_line()).unwrap(), msg);
        }
    }
}
