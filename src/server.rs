//! Connection handling for the enclave listener
//!
//! One request per connection. The peer writes a single JSON document and
//! either half-closes or waits; the enclave answers once and closes.

use crate::error::{EnclaveError, Result};
use crate::protocol::{Dispatcher, ProtocolResponse};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 4096;

/// Backoff after a failed accept so a full fd table does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection read limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            max_request_bytes: 64 * 1024,
        }
    }
}

/// What was read off a connection
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Request(Vec<u8>),
    /// Peer closed without sending anything
    Empty,
    Oversized,
}

/// Reads until one JSON document is complete, the peer half-closes, or the
/// size limit is exceeded
pub async fn read_request<R>(reader: &mut R, max_bytes: usize) -> Result<Incoming>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buf.is_empty() {
                Incoming::Empty
            } else {
                Incoming::Request(buf)
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max_bytes {
            return Ok(Incoming::Oversized);
        }
        if document_complete(&buf) {
            return Ok(Incoming::Request(buf));
        }
    }
}

/// True once more bytes cannot change the parse outcome
fn document_complete(buf: &[u8]) -> bool {
    match serde_json::from_slice::<serde::de::IgnoredAny>(buf) {
        Ok(_) => true,
        Err(e) => !e.is_eof(),
    }
}

/// Serves exactly one request on `stream` and closes it
pub async fn serve_connection<S>(
    mut stream: S,
    dispatcher: Arc<Dispatcher>,
    limits: ConnectionLimits,
    peer: impl Display,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let incoming = match tokio::time::timeout(
        limits.read_timeout,
        read_request(&mut stream, limits.max_request_bytes),
    )
    .await
    {
        Ok(Ok(incoming)) => incoming,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Read error");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout_secs = limits.read_timeout.as_secs_f64(), "Read timed out");
            return;
        }
    };

    let response = match incoming {
        Incoming::Empty => {
            debug!(peer = %peer, "Connection closed without a request");
            return;
        }
        Incoming::Oversized => {
            warn!(peer = %peer, limit = limits.max_request_bytes, "Request too large");
            ProtocolResponse::from_error(&EnclaveError::MalformedRequest(
                "request too large".to_string(),
            ))
            .to_bytes()
        }
        Incoming::Request(body) => {
            // A panic in a handler must not take the listener down with it
            let handler = tokio::spawn(async move { dispatcher.handle(&body).await });
            match handler.await {
                Ok(response) => response,
                Err(e) => {
                    error!(peer = %peer, error = %e, "Request handler aborted");
                    ProtocolResponse::error("internal_error").to_bytes()
                }
            }
        }
    };

    if let Err(e) = write_response(&mut stream, &response).await {
        warn!(peer = %peer, error = %e, "Failed to write response");
    }
}

async fn write_response<W>(writer: &mut W, response: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response).await?;
    writer.flush().await?;
    writer.shutdown().await
}

/// Binds the TCP stand-in listener on all interfaces
pub async fn bind_tcp(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EnclaveError::Transport(format!("Failed to bind {}: {}", addr, e)))?;
    info!(address = %addr, "TCP listener bound");
    Ok(listener)
}

/// Accept loop for TCP; one task per connection
pub async fn serve_tcp(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    limits: ConnectionLimits,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                debug!(remote_addr = %remote_addr, "Accepted connection");
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(serve_connection(stream, dispatcher, limits, remote_addr));
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::vsock::{bind_vsock, serve_vsock};

#[cfg(target_os = "linux")]
mod vsock {
    use super::*;
    use tokio_vsock::{VsockAddr, VsockListener};

    /// Binds the vsock listener on every CID
    pub fn bind_vsock(port: u32) -> Result<VsockListener> {
        let addr = VsockAddr::new(nix::libc::VMADDR_CID_ANY, port);
        let listener = VsockListener::bind(addr).map_err(|e| {
            EnclaveError::Transport(format!("Failed to bind vsock port {}: {}", port, e))
        })?;
        info!(cid = "ANY", port = port, "vsock listener bound");
        Ok(listener)
    }

    /// Accept loop for vsock; one task per connection
    pub async fn serve_vsock(
        mut listener: VsockListener,
        dispatcher: Arc<Dispatcher>,
        limits: ConnectionLimits,
    ) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(addr = ?addr, "Accepted connection");
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(serve_connection(
                        stream,
                        dispatcher,
                        limits,
                        format!("{:?}", addr),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}
