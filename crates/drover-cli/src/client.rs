//! Control socket client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use drover_core::protocol::{CommandOutcome, ControlRequest, ControlResponse, decode, encode};
use drover_core::status::PoolStatus;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] drover_core::Error),

    #[error("daemon closed the connection without answering")]
    NoResponse,

    #[error("timed out after {0:?} waiting for the daemon")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    Unexpected(String),

    /// The daemon refused or failed the command.
    #[error("{0}")]
    Rejected(String),
}

/// One request per connection, as the daemon expects.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    /// Give up waiting after `timeout`. Without one, mutating commands wait
    /// as long as the pool takes to settle.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, ClientError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(request))
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => self.exchange(request).await,
        }
    }

    async fn exchange(&self, request: &ControlRequest) -> Result<ControlResponse, ClientError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.path.clone(),
                source,
            })?;
        let (read, mut write) = stream.into_split();
        write.write_all(encode(request)?.as_bytes()).await?;
        write.shutdown().await?;
        debug!(?request, "request sent");

        let mut line = String::new();
        let n = BufReader::new(read).read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::NoResponse);
        }
        Ok(decode(&line)?)
    }

    /// Send a mutating command and wait for its outcome.
    pub async fn command(&self, request: &ControlRequest) -> Result<CommandOutcome, ClientError> {
        match self.request(request).await? {
            ControlResponse::Ok { outcome } => Ok(outcome),
            ControlResponse::Error { message } => Err(ClientError::Rejected(message)),
            ControlResponse::Status { .. } => {
                Err(ClientError::Unexpected("status in reply to a command".into()))
            }
        }
    }

    pub async fn status(&self) -> Result<PoolStatus, ClientError> {
        match self.request(&ControlRequest::Status).await? {
            ControlResponse::Status { status } => Ok(status),
            ControlResponse::Error { message } => Err(ClientError::Rejected(message)),
            ControlResponse::Ok { outcome } => Err(ClientError::Unexpected(format!("{outcome:?}"))),
        }
    }
}
