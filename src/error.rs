//! Error types for the confidential enclave

use thiserror::Error;

/// Errors that can occur in the enclave
///
/// Every variant is recovered at the connection boundary and turned into a
/// `{"status":"error","reason":...}` response. Only [`EnclaveError::reason`]
/// ever crosses the wire; the `Display` text is for logs.
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Enclave has no traffic session key")]
    NotConfigured,

    #[error("Attestation unavailable: {0}")]
    AttestationUnavailable(String),

    #[error("Key service error: {0}")]
    KeyService(String),

    #[error("Invalid key material: expected 32 bytes, got {0}")]
    InvalidKeyMaterial(usize),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Recipient envelope error: {0}")]
    Recipient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnclaveError {
    /// Short machine-readable reason sent back to the caller.
    ///
    /// Authentication failures share `decryption_failed` with every other
    /// decrypt failure so the response cannot act as a padding/tag oracle.
    pub fn reason(&self) -> &'static str {
        match self {
            EnclaveError::MalformedRequest(_) | EnclaveError::MalformedEnvelope(_) => "malformed",
            EnclaveError::UnknownMessageType(_) => "unknown_type",
            EnclaveError::NotConfigured => "not_configured",
            EnclaveError::AttestationUnavailable(_) => "attestation_unavailable",
            EnclaveError::KeyService(_) | EnclaveError::Recipient(_) => "key_service_error",
            EnclaveError::InvalidKeyMaterial(_) => "invalid_key_material",
            EnclaveError::AuthenticationFailure | EnclaveError::InvalidKeyLength(_) => {
                "decryption_failed"
            }
            EnclaveError::Transport(_) | EnclaveError::Io(_) => "transport_error",
            EnclaveError::Crypto(_) | EnclaveError::Config(_) | EnclaveError::Serialization(_) => {
                "internal_error"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EnclaveError>;
