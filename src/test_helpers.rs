//! In-memory attestor and key-service doubles shared by unit tests

use crate::attestation::{AttestationDocument, AttestationRequest, Attestor};
use crate::error::{EnclaveError, Result};
use crate::kms::{KeyReleaseRequest, KeyService};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};
use zeroize::Zeroizing;

pub(crate) const MOCK_DOCUMENT: &[u8] = b"MOCK_ATTESTATION_DOCUMENT";

#[derive(Debug, Clone)]
pub(crate) struct AttestationCall {
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Returns a fixed document and records what was bound into it
#[derive(Default)]
pub(crate) struct RecordingAttestor {
    calls: Mutex<Vec<AttestationCall>>,
}

impl RecordingAttestor {
    pub fn calls(&self) -> Vec<AttestationCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Attestor for RecordingAttestor {
    fn attestation_document(&self, request: AttestationRequest<'_>) -> Result<AttestationDocument> {
        self.calls.lock().unwrap().push(AttestationCall {
            public_key: request.public_key.unwrap_or_default().to_vec(),
            nonce: request.nonce.unwrap_or_default().to_vec(),
        });
        Ok(AttestationDocument {
            document: MOCK_DOCUMENT.to_vec(),
        })
    }
}

/// Behaves like a host without `/dev/nsm`
pub(crate) struct FailingAttestor;

impl Attestor for FailingAttestor {
    fn attestation_document(&self, _request: AttestationRequest<'_>) -> Result<AttestationDocument> {
        Err(EnclaveError::AttestationUnavailable(
            "Failed to open NSM device".to_string(),
        ))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub attestation: Vec<u8>,
}

/// Releases the same plaintext for every attested request
pub(crate) struct StaticKeyService {
    plaintext: Vec<u8>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl StaticKeyService {
    pub fn new(plaintext: Vec<u8>) -> Self {
        Self {
            plaintext,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyService for StaticKeyService {
    async fn decrypt(&self, request: KeyReleaseRequest<'_>) -> Result<Zeroizing<Vec<u8>>> {
        self.seen.lock().unwrap().push(SeenRequest {
            ciphertext: request.ciphertext.to_vec(),
            key_id: request.key_id.to_string(),
            attestation: request.attestation.document.clone(),
        });
        if request.attestation.document.is_empty() {
            return Err(EnclaveError::KeyService("missing attestation".to_string()));
        }
        Ok(Zeroizing::new(self.plaintext.clone()))
    }
}

/// Rejects every request the way a key policy mismatch does
pub(crate) struct RejectingKeyService;

#[async_trait]
impl KeyService for RejectingKeyService {
    async fn decrypt(&self, _request: KeyReleaseRequest<'_>) -> Result<Zeroizing<Vec<u8>>> {
        Err(EnclaveError::KeyService(
            "AccessDeniedException: attestation does not satisfy key policy".to_string(),
        ))
    }
}

/// Holds each decrypt until the test opens the gate
pub(crate) struct GatedKeyService {
    plaintext: Vec<u8>,
    pub entered: Notify,
    pub gate: Semaphore,
}

impl GatedKeyService {
    pub fn new(plaintext: Vec<u8>) -> Self {
        Self {
            plaintext,
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl KeyService for GatedKeyService {
    async fn decrypt(&self, _request: KeyReleaseRequest<'_>) -> Result<Zeroizing<Vec<u8>>> {
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EnclaveError::KeyService(e.to_string()))?;
        Ok(Zeroizing::new(self.plaintext.clone()))
    }
}

/// How [`seal_for_recipient`] encodes the CMS structure
#[derive(Debug, Clone, Copy)]
pub(crate) enum CmsEncoding {
    Der,
    /// Indefinite lengths and chunked encrypted content, as KMS emits
    Ber,
}

const CONTENT_KEY: [u8; 32] = [0x5a; 32];
const CONTENT_IV: [u8; 16] = [0x0c; 16];

/// Builds a `CiphertextForRecipient` the way KMS does: AES-256-CBC content,
/// content key wrapped with RSA-OAEP-SHA256 to `public_key_der`
pub(crate) fn seal_for_recipient(
    public_key_der: &[u8],
    plaintext: &[u8],
    encoding: CmsEncoding,
) -> Vec<u8> {
    use aes::Aes256;
    use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Oaep, RsaPublicKey};
    use sha2::Sha256;

    let wrapped_key = RsaPublicKey::from_public_key_der(public_key_der)
        .unwrap()
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &CONTENT_KEY)
        .unwrap();
    let encrypted = cbc::Encryptor::<Aes256>::new_from_slices(&CONTENT_KEY, &CONTENT_IV)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let version = tlv(0x02, &[2]);
    let ktri = tlv(
        0x30,
        &[
            version.clone(),
            tlv(0x80, &[0x11; 20]),
            tlv(0x30, &oid("1.2.840.113549.1.1.7")),
            tlv(0x04, &wrapped_key),
        ]
        .concat(),
    );
    let recip_infos = tlv(0x31, &ktri);
    let content_alg = tlv(
        0x30,
        &[oid("2.16.840.1.101.3.4.1.42"), tlv(0x04, &CONTENT_IV)].concat(),
    );
    let data_oid = oid("1.2.840.113549.1.7.1");
    let enveloped_oid = oid("1.2.840.113549.1.7.3");

    match encoding {
        CmsEncoding::Der => {
            let eci = tlv(
                0x30,
                &[data_oid, content_alg, tlv(0x80, &encrypted)].concat(),
            );
            let enveloped = tlv(0x30, &[version, recip_infos, eci].concat());
            tlv(0x30, &[enveloped_oid, tlv(0xa0, &enveloped)].concat())
        }
        CmsEncoding::Ber => {
            let (head, tail) = encrypted.split_at(encrypted.len() / 2);
            let chunks = indefinite(0xa0, &[tlv(0x04, head), tlv(0x04, tail)]);
            let eci = indefinite(0x30, &[data_oid, content_alg, chunks]);
            let enveloped = indefinite(0x30, &[version, recip_infos, eci]);
            indefinite(0x30, &[enveloped_oid, indefinite(0xa0, &[enveloped])])
        }
    }
}

fn oid(dotted: &str) -> Vec<u8> {
    tlv(0x06, der::asn1::ObjectIdentifier::new_unwrap(dotted).as_bytes())
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(content);
    out
}

fn indefinite(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![tag, 0x80];
    out.extend(parts.concat());
    out.extend_from_slice(&[0x00, 0x00]);
    out
}
