//! Unix socket server for the control protocol.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{dispatch, ErrorBody, Frame, Request, RpcError};
use crate::daemon::Daemon;
use crate::error::DaemonError;

/// Largest request line accepted.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub struct RpcServer {
    socket_path: PathBuf,
    daemon: Daemon,
}

impl RpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, daemon: Daemon) -> Self {
        Self {
            socket_path: socket_path.into(),
            daemon,
        }
    }

    fn bind(&self) -> Result<UnixListener, RpcError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;
        Ok(listener)
    }

    /// Accept connections until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RpcError> {
        let listener = self.bind()?;
        info!(path = %self.socket_path.display(), "RPC server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let daemon = self.daemon.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, daemon).await {
                            warn!(error = %e, "RPC connection failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("RPC server shutting down");
                        break;
                    }
                }
            }
        }

        remove_socket(&self.socket_path);
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    }
}

async fn handle_connection(stream: UnixStream, daemon: Daemon) -> Result<(), RpcError> {
    let (reader, mut writer) = stream.into_split();

    let Some(line) = read_request(reader).await? else {
        return Ok(());
    };

    let request: Request = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected malformed request");
            let frame = Frame::Error {
                error: ErrorBody {
                    code: "invalid_request".to_string(),
                    message: e.to_string(),
                },
            };
            return write_frame(&mut writer, &frame).await;
        }
    };

    let command = request.command();
    debug!(command, "RPC request");

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

    // The operation runs in its own task so a client hanging up mid-request
    // does not cancel it
    let mut task = tokio::spawn(async move { dispatch(&daemon, request, Some(progress_tx)).await });

    let joined = loop {
        tokio::select! {
            Some(message) = progress_rx.recv() => {
                write_frame(&mut writer, &Frame::Progress { message }).await?;
            }
            joined = &mut task => break joined,
        }
    };
    while let Ok(message) = progress_rx.try_recv() {
        write_frame(&mut writer, &Frame::Progress { message }).await?;
    }

    let frame = match joined {
        Ok(Ok(reply)) => Frame::Reply { reply },
        Ok(Err(e)) => {
            debug!(command, code = e.code(), error = %e, "RPC request failed");
            Frame::Error {
                error: ErrorBody::from(&e),
            }
        }
        Err(e) => Frame::Error {
            error: ErrorBody::from(&DaemonError::Internal(e.to_string())),
        },
    };
    write_frame(&mut writer, &frame).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read the first line of the connection. `None` when the client closed
/// without sending anything.
async fn read_request<R>(reader: R) -> Result<Option<String>, RpcError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let mut reader = BufReader::new(reader.take(limit));
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_REQUEST_BYTES {
        return Err(RpcError::TooLarge(MAX_REQUEST_BYTES));
    }
    Ok(Some(line))
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut data = serde_json::to_vec(frame)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_line() {
        let input: &[u8] = b"{\"command\":\"list\"}\n{\"command\":\"version\"}\n";
        let line = read_request(input).await.unwrap().unwrap();
        assert_eq!(line.trim(), r#"{"command":"list"}"#);

        let empty: &[u8] = b"";
        assert!(read_request(empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_rejects_oversized() {
        let input = vec![b'a'; MAX_REQUEST_BYTES + 10];
        let err = read_request(input.as_slice()).await.unwrap_err();
        assert!(matches!(err, RpcError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_write_frame_is_newline_terminated() {
        let mut out = Vec::new();
        write_frame(
            &mut out,
            &Frame::Progress {
                message: "Starting instance".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(out.ends_with(b"\n"));
        let frame: Frame = serde_json::from_slice(&out[..out.len() - 1]).unwrap();
        assert!(matches!(frame, Frame::Progress { .. }));
    }
}
