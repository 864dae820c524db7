//! Environment configuration for the enclave process
//!
//! | Variable | Default |
//! |---|---|
//! | `LISTEN_PORT` | `5000` |
//! | `TRANSPORT` | `vsock` inside an enclave, `tcp` elsewhere |
//! | `READ_TIMEOUT_SECS` | `10` |
//! | `MAX_REQUEST_BYTES` | `65536` |
//! | `AWS_REGION` | `ap-southeast-1` |
//! | `KMS_VSOCK_PORT` | `8000` |
//! | `IMDS_VSOCK_PORT` | `8002` |
//! | `KMS_KEY_ID` + `ENCRYPTED_TSK` | unset; provision at boot when both are set |
//! | `LOG_LEVEL` | `info` |

use crate::error::{EnclaveError, Result};
use crate::protocol::ConfigureParams;
use crate::server::ConnectionLimits;
use crate::vsock_transport::{VsockConfig, VSOCK_PORT_IMDS, VSOCK_PORT_KMS};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Port the enclave listens on
pub const DEFAULT_LISTEN_PORT: u32 = 5000;

/// CID the parent assigns to the enclave in the reference deployment
pub const DEFAULT_ENCLAVE_CID: u32 = 16;

pub const DEFAULT_REGION: &str = "ap-southeast-1";
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Which listener to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Vsock,
    /// TCP stand-in for local development and tests
    Tcp,
}

impl FromStr for TransportMode {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vsock" => Ok(TransportMode::Vsock),
            "tcp" => Ok(TransportMode::Tcp),
            other => Err(EnclaveError::Config(format!(
                "TRANSPORT must be `vsock` or `tcp`, got `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    pub listen_port: u32,
    /// `None` lets the process pick based on NSM availability
    pub transport: Option<TransportMode>,
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
    pub region: String,
    pub kms_vsock_port: u32,
    pub imds_vsock_port: u32,
    /// Key blob to provision before serving
    pub boot_key: Option<ConfigureParams>,
    pub log_level: Level,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            transport: None,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            region: DEFAULT_REGION.to_string(),
            kms_vsock_port: VSOCK_PORT_KMS,
            imds_vsock_port: VSOCK_PORT_IMDS,
            boot_key: None,
            log_level: Level::INFO,
        }
    }
}

impl EnclaveConfig {
    /// Reads the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let boot_key = match (get("ENCRYPTED_TSK"), get("KMS_KEY_ID")) {
            (Some(blob), Some(key_id)) => Some(ConfigureParams {
                encrypted_key: STANDARD.decode(blob.trim()).map_err(|e| {
                    EnclaveError::Config(format!("ENCRYPTED_TSK is not valid base64: {}", e))
                })?,
                key_id,
            }),
            (Some(_), None) => {
                return Err(EnclaveError::Config(
                    "ENCRYPTED_TSK is set but KMS_KEY_ID is missing".to_string(),
                ))
            }
            _ => None,
        };

        Ok(Self {
            listen_port: parse_or(get("LISTEN_PORT"), "LISTEN_PORT", defaults.listen_port)?,
            transport: get("TRANSPORT").map(|t| t.parse()).transpose()?,
            read_timeout: Duration::from_secs(parse_or(
                get("READ_TIMEOUT_SECS"),
                "READ_TIMEOUT_SECS",
                DEFAULT_READ_TIMEOUT_SECS,
            )?),
            max_request_bytes: parse_or(
                get("MAX_REQUEST_BYTES"),
                "MAX_REQUEST_BYTES",
                defaults.max_request_bytes,
            )?,
            region: get("AWS_REGION").unwrap_or(defaults.region),
            kms_vsock_port: parse_or(get("KMS_VSOCK_PORT"), "KMS_VSOCK_PORT", defaults.kms_vsock_port)?,
            imds_vsock_port: parse_or(
                get("IMDS_VSOCK_PORT"),
                "IMDS_VSOCK_PORT",
                defaults.imds_vsock_port,
            )?,
            boot_key,
            log_level: parse_or(get("LOG_LEVEL"), "LOG_LEVEL", defaults.log_level)?,
        })
    }

    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            read_timeout: self.read_timeout,
            max_request_bytes: self.max_request_bytes,
        }
    }

    pub fn vsock(&self) -> VsockConfig {
        VsockConfig {
            kms_port: self.kms_vsock_port,
            imds_port: self.imds_vsock_port,
            region: self.region.clone(),
        }
    }

    /// Listen port as a TCP port
    pub fn tcp_port(&self) -> Result<u16> {
        u16::try_from(self.listen_port).map_err(|_| {
            EnclaveError::Config(format!("LISTEN_PORT {} is not a TCP port", self.listen_port))
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, name: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EnclaveError::Config(format!("Invalid value for {}: `{}`", name, raw))),
        None => Ok(default),
    }
}
