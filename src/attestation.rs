//! Hardware attestation through the Nitro Secure Module (NSM)
//!
//! Every provisioning attempt asks the NSM for a fresh attestation document.
//! Documents are never cached: the key service checks the document's
//! measurements, and a stale one could authorize a decrypt for a boot that no
//! longer exists.
//!
//! There is no fallback. If `/dev/nsm` cannot be opened the caller gets
//! [`EnclaveError::AttestationUnavailable`] and provisioning stops.

use crate::error::{EnclaveError, Result};
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use serde_bytes::ByteBuf;
use tracing::{debug, info};

/// Signed attestation document from the NSM (CBOR/COSE_Sign1)
#[derive(Clone)]
pub struct AttestationDocument {
    pub document: Vec<u8>,
}

impl std::fmt::Debug for AttestationDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationDocument")
            .field("len", &self.document.len())
            .finish()
    }
}

/// Values bound into a requested document
#[derive(Debug, Default, Clone, Copy)]
pub struct AttestationRequest<'a> {
    /// DER-encoded public key the key service encrypts its reply to
    pub public_key: Option<&'a [u8]>,
    /// Freshness nonce
    pub nonce: Option<&'a [u8]>,
    pub user_data: Option<&'a [u8]>,
}

/// Source of attestation documents
pub trait Attestor: Send + Sync {
    fn attestation_document(&self, request: AttestationRequest<'_>) -> Result<AttestationDocument>;
}

/// Attestor backed by the NSM device
///
/// Opens the device for each document and closes it again, so the enclave
/// holds no NSM descriptor between provisioning attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsmAttestor;

impl NsmAttestor {
    pub fn new() -> Self {
        Self
    }
}

/// Open NSM descriptor; closed on drop
struct NsmSession {
    fd: i32,
}

impl NsmSession {
    fn open() -> Result<Self> {
        let fd = nsm_init();
        if fd < 0 {
            return Err(EnclaveError::AttestationUnavailable(
                "Failed to open NSM device".to_string(),
            ));
        }
        Ok(Self { fd })
    }
}

impl Drop for NsmSession {
    fn drop(&mut self) {
        nsm_exit(self.fd);
    }
}

impl Attestor for NsmAttestor {
    fn attestation_document(&self, request: AttestationRequest<'_>) -> Result<AttestationDocument> {
        let session = NsmSession::open()?;

        let nsm_request = Request::Attestation {
            user_data: request.user_data.map(|d| ByteBuf::from(d.to_vec())),
            nonce: request.nonce.map(|n| ByteBuf::from(n.to_vec())),
            public_key: request.public_key.map(|k| ByteBuf::from(k.to_vec())),
        };

        match nsm_process_request(session.fd, nsm_request) {
            Response::Attestation { document } => {
                debug!(document_len = document.len(), "Received attestation document");
                Ok(AttestationDocument { document })
            }
            Response::Error(err) => Err(EnclaveError::AttestationUnavailable(format!(
                "NSM rejected attestation request: {:?}",
                err
            ))),
            _ => Err(EnclaveError::AttestationUnavailable(
                "Unexpected NSM response".to_string(),
            )),
        }
    }
}

/// Reports whether the NSM device can be opened, i.e. we run inside an enclave
pub fn nsm_available() -> bool {
    match NsmSession::open() {
        Ok(_) => {
            info!("NSM device available");
            true
        }
        Err(_) => false,
    }
}
