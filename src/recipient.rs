//! Ephemeral recipient key for attestation-bound key release
//!
//! KMS never returns the plaintext to an attested caller. It returns
//! `CiphertextForRecipient`: a CMS EnvelopedData (RFC 5652) in which the data
//! is AES-256-CBC encrypted and the content-encryption key is wrapped with
//! RSAES-OAEP-SHA256 to the public key embedded in the attestation document.
//!
//! KMS produces the blob with a BER encoder, so it is normalised to DER
//! before decoding.
//!
//! A [`RecipientKey`] is generated per provisioning attempt and dropped as
//! soon as the reply is opened.

use crate::ber;
use crate::error::{EnclaveError, Result};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use cms::content_info::ContentInfo;
use cms::enveloped_data::{EnvelopedData, RecipientInfo};
use der::asn1::{ObjectIdentifier, OctetString};
use der::Decode;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Modulus size KMS accepts for `RSAES_OAEP_SHA_256` recipients
pub const RSA_BITS: usize = 2048;

const ID_ENVELOPED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.3");
const ID_AES256_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");

/// RSA key pair whose public half is bound into the attestation document
pub struct RecipientKey {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl RecipientKey {
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
            .map_err(|e| EnclaveError::Crypto(format!("Failed to generate recipient key: {}", e)))?;
        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| EnclaveError::Crypto(format!("Failed to encode recipient key: {}", e)))?
            .as_bytes()
            .to_vec();

        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// DER SubjectPublicKeyInfo, as expected in the NSM `public_key` field
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Opens a `CiphertextForRecipient` blob and returns the released plaintext
    pub fn open(&self, ciphertext_for_recipient: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let der = ber::to_der(ciphertext_for_recipient)?;
        let content_info = ContentInfo::from_der(&der)
            .map_err(|e| EnclaveError::Recipient(format!("Not a CMS ContentInfo: {}", e)))?;
        if content_info.content_type != ID_ENVELOPED_DATA {
            return Err(EnclaveError::Recipient(format!(
                "Unexpected CMS content type {}",
                content_info.content_type
            )));
        }

        let enveloped: EnvelopedData = content_info
            .content
            .decode_as()
            .map_err(|e| EnclaveError::Recipient(format!("Invalid EnvelopedData: {}", e)))?;

        let wrapped_key = enveloped
            .recip_infos
            .0
            .iter()
            .find_map(|info| match info {
                RecipientInfo::Ktri(ktri) => Some(ktri.enc_key.as_bytes()),
                _ => None,
            })
            .ok_or_else(|| {
                EnclaveError::Recipient("No key transport recipient info".to_string())
            })?;

        let content_key = Zeroizing::new(
            self.private_key
                .decrypt_blinded(&mut rand::thread_rng(), Oaep::new::<Sha256>(), wrapped_key)
                .map_err(|_| EnclaveError::Recipient("Failed to unwrap content key".to_string()))?,
        );

        let algorithm = &enveloped.encrypted_content.content_enc_alg;
        if algorithm.oid != ID_AES256_CBC {
            return Err(EnclaveError::Recipient(format!(
                "Unsupported content encryption algorithm {}",
                algorithm.oid
            )));
        }
        let iv: OctetString = algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| EnclaveError::Recipient("Missing CBC IV".to_string()))?
            .decode_as()
            .map_err(|e| EnclaveError::Recipient(format!("Invalid CBC IV: {}", e)))?;

        let encrypted = enveloped
            .encrypted_content
            .encrypted_content
            .as_ref()
            .ok_or_else(|| EnclaveError::Recipient("Missing encrypted content".to_string()))?;

        let plaintext = cbc::Decryptor::<Aes256>::new_from_slices(&content_key, iv.as_bytes())
            .map_err(|_| EnclaveError::Recipient("Invalid content key or IV length".to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(encrypted.as_bytes())
            .map_err(|_| EnclaveError::Recipient("Failed to decrypt content".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{seal_for_recipient, CmsEncoding};
    use rsa::pkcs8::DecodePublicKey;
    use rsa::RsaPublicKey;

    #[test]
    fn test_public_key_is_spki_der() {
        let key = RecipientKey::generate().expect("Failed to generate key");
        let der = key.public_key_der();
        assert_eq!(der[0], 0x30);
        assert!(RsaPublicKey::from_public_key_der(der).is_ok());
    }

    #[test]
    fn test_each_attempt_gets_a_new_key() {
        let a = RecipientKey::generate().unwrap();
        let b = RecipientKey::generate().unwrap();
        assert_ne!(a.public_key_der(), b.public_key_der());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let key = RecipientKey::generate().unwrap();
        let err = key.open(b"definitely not DER").unwrap_err();
        assert!(matches!(err, EnclaveError::Recipient(_)));
        assert_eq!(err.reason(), "key_service_error");
    }

    #[test]
    fn test_open_der_reply() {
        let key = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(key.public_key_der(), &[0x42; 32], CmsEncoding::Der);
        assert_eq!(key.open(&blob).unwrap().as_slice(), &[0x42; 32]);
    }

    #[test]
    fn test_open_ber_reply() {
        let key = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(key.public_key_der(), &[0x42; 32], CmsEncoding::Ber);
        assert_eq!(blob[1], 0x80);
        assert_eq!(key.open(&blob).unwrap().as_slice(), &[0x42; 32]);
    }

    #[test]
    fn test_open_with_another_key_fails() {
        let intended = RecipientKey::generate().unwrap();
        let other = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(intended.public_key_der(), &[0x42; 32], CmsEncoding::Der);

        let err = other.open(&blob).unwrap_err();
        assert!(matches!(err, EnclaveError::Recipient(_)));
    }

    #[test]
    fn test_open_rejects_truncated_reply() {
        let key = RecipientKey::generate().unwrap();
        let blob = seal_for_recipient(key.public_key_der(), &[0x42; 32], CmsEncoding::Der);
        assert!(key.open(&blob[..blob.len() - 1]).is_err());
    }
}
