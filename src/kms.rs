//! Key service for attestation-gated key release
//!
//! The traffic session key only exists outside the enclave as a KMS
//! ciphertext blob. Releasing it requires presenting an attestation document:
//!
//! 1. Generate an ephemeral [`RecipientKey`] and an attestation document that
//!    embeds its public key.
//! 2. Call `kms:Decrypt` with the document as the `Recipient` parameter. KMS
//!    checks the document's PCRs against the key policy.
//! 3. KMS returns the plaintext re-encrypted to the recipient key
//!    (`CiphertextForRecipient`), which only this enclave can open.
//!
//! A reply that carries bare `Plaintext` instead is rejected: that only
//! happens when the `Recipient` parameter was ignored, and accepting it would
//! let the key leave KMS unattested.
//!
//! ## Reference
//!
//! - [AWS KMS cryptographic attestation](https://docs.aws.amazon.com/kms/latest/developerguide/services-nitro-enclaves.html)

use crate::attestation::AttestationDocument;
use crate::error::{EnclaveError, Result};
use crate::recipient::RecipientKey;
use async_trait::async_trait;
use aws_sdk_kms::operation::decrypt::DecryptOutput;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{KeyEncryptionMechanism, RecipientInfo};
use aws_sdk_kms::Client as KmsClient;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// One attested decrypt call
pub struct KeyReleaseRequest<'a> {
    /// Key-service ciphertext blob
    pub ciphertext: &'a [u8],
    /// Key id or ARN; empty lets the service infer it from the blob
    pub key_id: &'a str,
    pub attestation: &'a AttestationDocument,
    /// Private half of the key bound into `attestation`
    pub recipient: &'a RecipientKey,
}

/// External key-management service
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Returns the released plaintext, or [`EnclaveError::KeyService`] on any
    /// network, permission or policy failure
    async fn decrypt(&self, request: KeyReleaseRequest<'_>) -> Result<Zeroizing<Vec<u8>>>;
}

/// AWS KMS wrapper for enclave operations
pub struct EnclaveKms {
    client: KmsClient,
}

impl EnclaveKms {
    /// Creates a new EnclaveKms client
    pub fn new(client: KmsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyService for EnclaveKms {
    async fn decrypt(&self, request: KeyReleaseRequest<'_>) -> Result<Zeroizing<Vec<u8>>> {
        info!(
            key_id = %request.key_id,
            ciphertext_len = request.ciphertext.len(),
            attestation_len = request.attestation.document.len(),
            "Decrypting with attestation"
        );

        let recipient = RecipientInfo::builder()
            .attestation_document(Blob::new(request.attestation.document.clone()))
            .key_encryption_algorithm(KeyEncryptionMechanism::RsaesOaepSha256)
            .build();

        let mut call = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(request.ciphertext))
            .recipient(recipient);
        if !request.key_id.is_empty() {
            call = call.key_id(request.key_id);
        }

        let response = call
            .send()
            .await
            .map_err(|e| EnclaveError::KeyService(format!("Decrypt with attestation failed: {}", e)))?;

        release_from_output(&response, request.recipient)
    }
}

/// Extracts the released key from a recipient-bound `Decrypt` reply
///
/// Only `CiphertextForRecipient` is accepted; bare `Plaintext` fails closed.
fn release_from_output(
    output: &DecryptOutput,
    recipient: &RecipientKey,
) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(ciphertext_for_recipient) = output.ciphertext_for_recipient() {
        debug!(
            recipient_ciphertext_len = ciphertext_for_recipient.as_ref().len(),
            "Received ciphertext for recipient"
        );
        recipient.open(ciphertext_for_recipient.as_ref())
    } else if output.plaintext().is_some() {
        warn!("KMS returned plaintext for a recipient-bound decrypt, rejecting");
        Err(EnclaveError::KeyService(
            "Plaintext returned without recipient binding".to_string(),
        ))
    } else {
        Err(EnclaveError::KeyService(
            "No ciphertext_for_recipient in response".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{seal_for_recipient, CmsEncoding};

    #[test]
    fn test_recipient_ciphertext_is_opened() {
        let recipient = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(recipient.public_key_der(), &[0x42; 32], CmsEncoding::Ber);
        let output = DecryptOutput::builder()
            .ciphertext_for_recipient(Blob::new(blob))
            .build();

        let key = release_from_output(&output, &recipient).unwrap();
        assert_eq!(key.as_slice(), &[0x42; 32]);
    }

    #[test]
    fn test_bare_plaintext_fails_closed() {
        let recipient = RecipientKey::generate().unwrap();
        let output = DecryptOutput::builder()
            .plaintext(Blob::new(vec![0x42; 32]))
            .build();

        let err = release_from_output(&output, &recipient).unwrap_err();
        assert!(matches!(err, EnclaveError::KeyService(_)));
        assert_eq!(err.reason(), "key_service_error");
    }

    #[test]
    fn test_empty_reply_fails() {
        let recipient = RecipientKey::generate().unwrap();
        let output = DecryptOutput::builder().build();

        let err = release_from_output(&output, &recipient).unwrap_err();
        assert!(matches!(err, EnclaveError::KeyService(_)));
    }

    #[test]
    fn test_plaintext_field_is_ignored_when_bound() {
        let recipient = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(recipient.public_key_der(), &[0x42; 32], CmsEncoding::Der);
        let output = DecryptOutput::builder()
            .ciphertext_for_recipient(Blob::new(blob))
            .plaintext(Blob::new(vec![0x00; 32]))
            .build();

        let key = release_from_output(&output, &recipient).unwrap();
        assert_eq!(key.as_slice(), &[0x42; 32]);
    }

    #[test]
    fn test_unreadable_recipient_ciphertext() {
        let recipient = RecipientKey::generate().unwrap();
        let output = DecryptOutput::builder()
            .ciphertext_for_recipient(Blob::new(b"not cms".to_vec()))
            .build();

        let err = release_from_output(&output, &recipient).unwrap_err();
        assert_eq!(err.reason(), "key_service_error");
    }
}
