//! Operator control socket.
//!
//! A Unix socket speaking the NDJSON control protocol: each connection
//! carries one [`ControlRequest`] line and receives one [`ControlResponse`]
//! line. Mutating requests block until the pool has settled, so `drover
//! stop` returns only once every worker is gone.

use std::path::{Path, PathBuf};

use drover_core::protocol::{ControlRequest, ControlResponse, decode, encode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::pool::ControlCommand;
use crate::supervisor::SupervisorHandle;

/// Requests longer than this are cut off and fail to decode.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn bind(path: &Path) -> Result<Self, PoolError> {
        let bind_err = |e: std::io::Error| PoolError::Bind {
            addr: path.display().to_string(),
            reason: e.to_string(),
        };
        if path.exists() {
            std::fs::remove_file(path).map_err(bind_err)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` fires, then remove the socket file.
    pub async fn run(self, handle: SupervisorHandle, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &handle).await {
                                debug!(error = %e, "control connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                },
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "could not remove control socket");
        }
    }
}

async fn serve_connection(stream: UnixStream, handle: &SupervisorHandle) -> drover_core::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response = match decode::<ControlRequest>(&line) {
        Ok(request) => answer(handle, request).await,
        Err(e) => ControlResponse::Error {
            message: format!("invalid request: {e}"),
        },
    };
    write.write_all(encode(&response)?.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

/// Execute one control request against the supervisor.
pub async fn answer(handle: &SupervisorHandle, request: ControlRequest) -> ControlResponse {
    let Some(command) = ControlCommand::from_request(&request) else {
        return ControlResponse::Status {
            status: handle.status().await,
        };
    };
    info!(?command, "control request");
    match handle.submit(command).await {
        Ok(outcome) => ControlResponse::Ok { outcome },
        Err(e) => {
            warn!(error = %e, "control request failed");
            ControlResponse::Error {
                message: e.to_string(),
            }
        }
    }
}
