//! Host-side client for the enclave listener
//!
//! Writes one request, half-closes, and reads the response until the
//! enclave closes the connection.

use crate::config::{DEFAULT_ENCLAVE_CID, DEFAULT_LISTEN_PORT};
use crate::envelope::Envelope;
use crate::error::{EnclaveError, Result};
use crate::protocol::ProtocolResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp(String),
}

#[derive(Debug, Clone)]
pub struct EnclaveClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl EnclaveClient {
    pub fn vsock(cid: u32, port: u32) -> Self {
        Self::new(Endpoint::Vsock { cid, port })
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Endpoint::Tcp(addr.into()))
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `ENCLAVE_TCP_ADDR` selects TCP; otherwise vsock to `ENCLAVE_CID`:`ENCLAVE_PORT`
    pub fn from_env() -> Result<Self> {
        if let Ok(addr) = std::env::var("ENCLAVE_TCP_ADDR") {
            return Ok(Self::tcp(addr));
        }
        let cid = env_u32("ENCLAVE_CID", DEFAULT_ENCLAVE_CID)?;
        let port = env_u32("ENCLAVE_PORT", DEFAULT_LISTEN_PORT)?;
        Ok(Self::vsock(cid, port))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends raw request bytes and returns the raw response
    ///
    /// An empty result means the enclave closed without answering.
    pub async fn send(&self, request: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| EnclaveError::Transport("Timed out waiting for enclave".to_string()))?
    }

    /// Sends a request and parses the response document
    pub async fn call(&self, request: &[u8]) -> Result<ProtocolResponse> {
        let raw = self.send(request).await?;
        if raw.is_empty() {
            return Err(EnclaveError::Transport(
                "Enclave closed the connection without a response".to_string(),
            ));
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await.map_err(|e| {
                    EnclaveError::Transport(format!("Failed to connect to {}: {}", addr, e))
                })?;
                round_trip(stream, request).await
            }
            Endpoint::Vsock { cid, port } => vsock_exchange(*cid, *port, request).await,
        }
    }
}

#[cfg(target_os = "linux")]
async fn vsock_exchange(cid: u32, port: u32, request: &[u8]) -> Result<Vec<u8>> {
    use tokio_vsock::{VsockAddr, VsockStream};

    let stream = VsockStream::connect(VsockAddr::new(cid, port))
        .await
        .map_err(|e| {
            EnclaveError::Transport(format!("Failed to connect to vsock {}:{}: {}", cid, port, e))
        })?;
    round_trip(stream, request).await
}

#[cfg(not(target_os = "linux"))]
async fn vsock_exchange(_cid: u32, _port: u32, _request: &[u8]) -> Result<Vec<u8>> {
    Err(EnclaveError::Transport(
        "vsock is only supported on Linux".to_string(),
    ))
}

async fn round_trip<S>(mut stream: S, request: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EnclaveError::Config(format!("Invalid value for {}: `{}`", name, raw))),
        Err(_) => Ok(default),
    }
}

pub fn ping_request() -> Vec<u8> {
    serde_json::json!({"type": "ping"}).to_string().into_bytes()
}

pub fn configure_request(encrypted_key: &[u8], key_id: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "configure",
        "encrypted_key": STANDARD.encode(encrypted_key),
        "key_id": key_id,
    })
    .to_string()
    .into_bytes()
}

pub fn process_request(envelope: &Envelope) -> Vec<u8> {
    serde_json::json!({"type": "process", "envelope": envelope})
        .to_string()
        .into_bytes()
}
