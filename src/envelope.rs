//! AES-256-GCM envelope codec
//!
//! An [`Envelope`] is the `(nonce, ciphertext)` pair that carries one
//! encrypted payload between the host and the enclave. On the wire both fields
//! are standard base64 strings:
//!
//! ```json
//! {"nonce": "<base64, 12 bytes>", "ciphertext": "<base64, ciphertext || tag>"}
//! ```
//!
//! Encryption uses no associated data and a fresh nonce from the system CSPRNG
//! on every call.

use crate::error::{EnclaveError, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// Length of a traffic session key
pub const KEY_LEN: usize = 32;

/// Length of the AES-GCM authentication tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// Encrypted payload as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Encrypts `plaintext` under `key` with a freshly drawn nonce
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Envelope> {
    let sealing_key = aead_key(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| EnclaveError::Crypto("Failed to draw nonce".to_string()))?;

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| EnclaveError::Crypto("Seal failed".to_string()))?;

    Ok(Envelope {
        nonce: nonce.to_vec(),
        ciphertext: in_out,
    })
}

/// Decrypts and authenticates `envelope` under `key`
///
/// Nothing from a failed open is returned; a bad tag, a flipped nonce bit and
/// a wrong key all surface as [`EnclaveError::AuthenticationFailure`].
pub fn decrypt(key: &[u8], envelope: &Envelope) -> Result<Vec<u8>> {
    let opening_key = aead_key(key)?;

    let nonce: [u8; NONCE_LEN] = envelope.nonce.as_slice().try_into().map_err(|_| {
        EnclaveError::MalformedEnvelope(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            envelope.nonce.len()
        ))
    })?;
    if envelope.ciphertext.len() < TAG_LEN {
        return Err(EnclaveError::MalformedEnvelope(format!(
            "ciphertext shorter than the {} byte tag",
            TAG_LEN
        )));
    }

    let mut in_out = envelope.ciphertext.clone();
    let plaintext_len = opening_key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| EnclaveError::AuthenticationFailure)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    if key.len() != KEY_LEN {
        return Err(EnclaveError::InvalidKeyLength(key.len()));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| EnclaveError::InvalidKeyLength(key.len()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Serde adapter for standard base64 byte fields
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
