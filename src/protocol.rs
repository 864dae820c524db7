//! Request/response protocol spoken over the host channel
//!
//! Each connection carries exactly one JSON request and one JSON response.
//!
//! ## Messages
//!
//! - `{"type":"ping"}` → `{"status":"ok","msg":"pong"}`
//! - `{"type":"configure","encrypted_key":"<base64>","key_id":"<id>"}` →
//!   `{"status":"ok"}`
//! - `{"type":"process","envelope":{"nonce":"<base64>","ciphertext":"<base64>"}}` →
//!   `{"status":"ok","envelope":{...}}`
//!
//! Every failure is `{"status":"error","reason":"<reason>"}` where `reason`
//! comes from [`EnclaveError::reason`].
//!
//! ## State machine
//!
//! The dispatcher is `Unconfigured` until a `configure` succeeds. `process`
//! is rejected with `not_configured` before that; `ping` and `configure` are
//! accepted in any state. A failed `configure` leaves the state unchanged.

use crate::envelope::{self, base64_bytes, Envelope};
use crate::error::{EnclaveError, Result};
use crate::provisioner::KeyProvisioner;
use crate::state::EnclaveConfigurationState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Marker prepended to every processed payload
pub const PROCESSED_PREFIX: &[u8] = b"Processed: ";

/// A parsed request
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolMessage {
    Ping,
    Configure(ConfigureParams),
    Process(ProcessParams),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Ping => "ping",
            ProtocolMessage::Configure(_) => "configure",
            ProtocolMessage::Process(_) => "process",
        }
    }
}

/// Body of a `configure` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureParams {
    /// Key-service ciphertext blob holding the TSK
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    /// Key id or ARN the blob was encrypted under
    pub key_id: String,
}

/// Body of a `process` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParams {
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Response document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl ProtocolResponse {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            msg: None,
            reason: None,
            envelope: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            msg: Some("pong".to_string()),
            ..Self::ok()
        }
    }

    pub fn with_envelope(envelope: Envelope) -> Self {
        Self {
            envelope: Some(envelope),
            ..Self::ok()
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            msg: None,
            reason: Some(reason.into()),
            envelope: None,
        }
    }

    pub fn from_error(err: &EnclaveError) -> Self {
        Self::error(err.reason())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"status":"error","reason":"internal_error"}"#.to_vec())
    }
}

/// Parses one request document
///
/// The body must be a JSON object with a string `type`. Unknown fields are
/// ignored; missing or mistyped known fields make the request malformed.
pub fn parse_message(body: &[u8]) -> Result<ProtocolMessage> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| EnclaveError::MalformedRequest(format!("Parse error: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| EnclaveError::MalformedRequest("Missing string field `type`".to_string()))?
        .to_string();

    match kind.as_str() {
        "ping" => Ok(ProtocolMessage::Ping),
        "configure" => Ok(ProtocolMessage::Configure(parse_params(value)?)),
        "process" => Ok(ProtocolMessage::Process(parse_params(value)?)),
        _ => Err(EnclaveError::UnknownMessageType(kind)),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| EnclaveError::MalformedRequest(format!("Invalid params: {}", e)))
}

/// The business transform applied to decrypted payloads
///
/// Pure: the output depends only on the input and key state is untouched.
pub fn process_payload(plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROCESSED_PREFIX.len() + plaintext.len());
    out.extend_from_slice(PROCESSED_PREFIX);
    out.extend_from_slice(plaintext);
    out
}

/// Routes requests to the ping, configure and process handlers
pub struct Dispatcher {
    state: Arc<EnclaveConfigurationState>,
    provisioner: KeyProvisioner,
}

impl Dispatcher {
    pub fn new(state: Arc<EnclaveConfigurationState>, provisioner: KeyProvisioner) -> Self {
        Self { state, provisioner }
    }

    pub fn state(&self) -> &Arc<EnclaveConfigurationState> {
        &self.state
    }

    /// Handles one raw request and returns the serialized response
    pub async fn handle(&self, request_body: &[u8]) -> Vec<u8> {
        let response = match parse_message(request_body) {
            Ok(message) => {
                let kind = message.kind();
                debug!(message_type = kind, "Dispatching request");
                match self.dispatch(message).await {
                    Ok(response) => {
                        info!(message_type = kind, status = "ok", "Request handled");
                        response
                    }
                    Err(e) => {
                        warn!(message_type = kind, reason = e.reason(), error = %e, "Request failed");
                        ProtocolResponse::from_error(&e)
                    }
                }
            }
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "Rejected request");
                ProtocolResponse::from_error(&e)
            }
        };

        response.to_bytes()
    }

    /// Applies one parsed message to the state machine
    pub async fn dispatch(&self, message: ProtocolMessage) -> Result<ProtocolResponse> {
        match message {
            ProtocolMessage::Ping => Ok(ProtocolResponse::pong()),
            ProtocolMessage::Configure(params) => self.handle_configure(params).await,
            ProtocolMessage::Process(params) => self.handle_process(params).await,
        }
    }

    /// Provisions a new TSK and installs it
    ///
    /// No lock is held while the key service runs; the write lock is taken
    /// only to swap the key. On failure the state is left as it was.
    pub async fn configure(&self, params: &ConfigureParams) -> Result<()> {
        let key = self
            .provisioner
            .provision_key(&params.encrypted_key, &params.key_id)
            .await?;
        self.state.install(key).await;
        info!(key_id = %params.key_id, "Enclave configured");
        Ok(())
    }

    async fn handle_configure(&self, params: ConfigureParams) -> Result<ProtocolResponse> {
        self.configure(&params).await?;
        Ok(ProtocolResponse::ok())
    }

    /// Decrypts, transforms and re-encrypts under the key captured at entry
    async fn handle_process(&self, params: ProcessParams) -> Result<ProtocolResponse> {
        let tsk = self.state.snapshot().await.ok_or(EnclaveError::NotConfigured)?;

        let plaintext = Zeroizing::new(envelope::decrypt(tsk.as_bytes(), &params.envelope)?);
        let result = Zeroizing::new(process_payload(&plaintext));
        let sealed = envelope::encrypt(tsk.as_bytes(), &result)?;

        debug!(
            input_len = params.envelope.ciphertext.len(),
            output_len = sealed.ciphertext.len(),
            "Payload processed"
        );
        Ok(ProtocolResponse::with_envelope(sealed))
    }
}
