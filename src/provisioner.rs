//! Attestation-gated key provisioning
//!
//! Exchanges a key-service ciphertext blob for the plaintext traffic session
//! key. Each attempt is independent: a new recipient key, a new nonce and a
//! new attestation document. Nothing is retried; the key service may allow
//! only one decrypt per document.

use crate::attestation::{AttestationDocument, AttestationRequest, Attestor};
use crate::error::{EnclaveError, Result};
use crate::kms::{KeyReleaseRequest, KeyService};
use crate::recipient::RecipientKey;
use crate::state::TrafficSessionKey;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{info, warn};

/// Nonce length embedded in each attestation document
pub const ATTESTATION_NONCE_LEN: usize = 32;

pub struct KeyProvisioner {
    attestor: Arc<dyn Attestor>,
    key_service: Arc<dyn KeyService>,
}

impl KeyProvisioner {
    pub fn new(attestor: Arc<dyn Attestor>, key_service: Arc<dyn KeyService>) -> Self {
        Self {
            attestor,
            key_service,
        }
    }

    /// Requests a fresh document binding `recipient`'s public key and a random nonce
    pub fn get_attestation_document(&self, recipient: &RecipientKey) -> Result<AttestationDocument> {
        attest_recipient(self.attestor.as_ref(), recipient)
    }

    /// Decrypts `encrypted_key` through the key service and returns the TSK
    ///
    /// Fails with `AttestationUnavailable`, `KeyService` or
    /// `InvalidKeyMaterial`. Configuration state is never touched here.
    pub async fn provision_key(&self, encrypted_key: &[u8], key_id: &str) -> Result<TrafficSessionKey> {
        if encrypted_key.is_empty() {
            return Err(EnclaveError::MalformedRequest(
                "encrypted_key is empty".to_string(),
            ));
        }
        info!(
            key_id = %key_id,
            encrypted_key_len = encrypted_key.len(),
            "Provisioning traffic session key"
        );

        // RSA key generation and the NSM ioctl both block
        let attestor = Arc::clone(&self.attestor);
        let (recipient, attestation) = tokio::task::spawn_blocking(move || {
            let recipient = RecipientKey::generate()?;
            let attestation = attest_recipient(attestor.as_ref(), &recipient)?;
            Ok::<_, EnclaveError>((recipient, attestation))
        })
        .await
        .map_err(|e| EnclaveError::Crypto(format!("Attestation task failed: {}", e)))?
        .map_err(|e| {
            warn!(key_id = %key_id, error = %e, "Attestation failed");
            e
        })?;

        let material = self
            .key_service
            .decrypt(KeyReleaseRequest {
                ciphertext: encrypted_key,
                key_id,
                attestation: &attestation,
                recipient: &recipient,
            })
            .await
            .map_err(|e| {
                warn!(key_id = %key_id, error = %e, "Key release failed");
                e
            })?;

        let key = TrafficSessionKey::from_slice(&material)?;
        info!(key_id = %key_id, "Traffic session key provisioned");
        Ok(key)
    }
}

fn attest_recipient(attestor: &dyn Attestor, recipient: &RecipientKey) -> Result<AttestationDocument> {
    let mut nonce = [0u8; ATTESTATION_NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| EnclaveError::Crypto("Failed to draw attestation nonce".to_string()))?;

    attestor.attestation_document(AttestationRequest {
        public_key: Some(recipient.public_key_der()),
        nonce: Some(&nonce),
        user_data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        FailingAttestor, RecordingAttestor, RejectingKeyService, StaticKeyService,
    };

    #[tokio::test]
    async fn test_provision_key() {
        let attestor = Arc::new(RecordingAttestor::default());
        let service = Arc::new(StaticKeyService::new([9u8; 32].to_vec()));
        let provisioner = KeyProvisioner::new(attestor.clone(), service.clone());

        let key = provisioner.provision_key(b"blob", "alias/tsk").await.unwrap();
        assert_eq!(key.as_bytes(), &[9u8; 32]);

        let seen = service.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ciphertext, b"blob");
        assert_eq!(seen[0].key_id, "alias/tsk");
        assert!(!seen[0].attestation.is_empty());
    }

    #[tokio::test]
    async fn test_each_attempt_is_freshly_attested() {
        let attestor = Arc::new(RecordingAttestor::default());
        let service = Arc::new(StaticKeyService::new([9u8; 32].to_vec()));
        let provisioner = KeyProvisioner::new(attestor.clone(), service);

        provisioner.provision_key(b"blob", "k").await.unwrap();
        provisioner.provision_key(b"blob", "k").await.unwrap();

        let calls = attestor.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert_eq!(call.nonce.len(), ATTESTATION_NONCE_LEN);
            assert!(!call.public_key.is_empty());
        }
        assert_ne!(calls[0].nonce, calls[1].nonce);
        assert_ne!(calls[0].public_key, calls[1].public_key);
    }

    #[tokio::test]
    async fn test_attestation_failure_is_fatal() {
        let service = Arc::new(StaticKeyService::new([9u8; 32].to_vec()));
        let provisioner = KeyProvisioner::new(Arc::new(FailingAttestor), service.clone());

        let err = provisioner.provision_key(b"blob", "k").await.unwrap_err();
        assert!(matches!(err, EnclaveError::AttestationUnavailable(_)));
        // No unattested fallback call was made
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn test_key_service_rejection() {
        let provisioner =
            KeyProvisioner::new(Arc::new(RecordingAttestor::default()), Arc::new(RejectingKeyService));
        let err = provisioner.provision_key(b"blob", "k").await.unwrap_err();
        assert_eq!(err.reason(), "key_service_error");
    }

    #[tokio::test]
    async fn test_wrong_length_material() {
        let provisioner = KeyProvisioner::new(
            Arc::new(RecordingAttestor::default()),
            Arc::new(StaticKeyService::new(vec![1u8; 16])),
        );
        let err = provisioner.provision_key(b"blob", "k").await.unwrap_err();
        assert!(matches!(err, EnclaveError::InvalidKeyMaterial(16)));
    }

    #[tokio::test]
    async fn test_empty_blob_is_malformed() {
        let service = Arc::new(StaticKeyService::new([9u8; 32].to_vec()));
        let provisioner = KeyProvisioner::new(Arc::new(RecordingAttestor::default()), service.clone());
        let err = provisioner.provision_key(b"", "k").await.unwrap_err();
        assert_eq!(err.reason(), "malformed");
        assert!(service.requests().is_empty());
    }

    #[test]
    fn test_get_attestation_document() {
        let attestor = Arc::new(RecordingAttestor::default());
        let provisioner = KeyProvisioner::new(attestor.clone(), Arc::new(RejectingKeyService));
        let recipient = RecipientKey::generate().unwrap();

        let doc = provisioner.get_attestation_document(&recipient).unwrap();
        assert!(!doc.document.is_empty());
        assert_eq!(attestor.calls()[0].public_key, recipient.public_key_der());
    }
}
