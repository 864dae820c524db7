//! Process-wide configuration state
//!
//! The enclave holds at most one traffic session key (TSK). It lives only in
//! memory, behind a read-mostly lock, and its bytes are wiped when the last
//! reference is dropped.

use crate::envelope::KEY_LEN;
use crate::error::{EnclaveError, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The 32-byte symmetric key used for every `process` payload
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TrafficSessionKey([u8; KEY_LEN]);

impl TrafficSessionKey {
    /// Accepts key material released by the key service
    ///
    /// This is the single place the key length is validated; the envelope
    /// codec only re-checks it as a guard.
    pub fn from_slice(material: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = material
            .try_into()
            .map_err(|_| EnclaveError::InvalidKeyMaterial(material.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TrafficSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrafficSessionKey(<redacted>)")
    }
}

/// `Unconfigured` until the first successful `configure`, then `Configured(TSK)`
#[derive(Debug, Default)]
pub struct EnclaveConfigurationState {
    tsk: RwLock<Option<Arc<TrafficSessionKey>>>,
}

impl EnclaveConfigurationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of the current key
    ///
    /// The lock is released before returning, so a request keeps using the
    /// key it captured even if a concurrent `configure` replaces it.
    pub async fn snapshot(&self) -> Option<Arc<TrafficSessionKey>> {
        self.tsk.read().await.clone()
    }

    /// Replaces the key; the previous one is wiped once in-flight users drop it
    pub async fn install(&self, key: TrafficSessionKey) {
        *self.tsk.write().await = Some(Arc::new(key));
    }

    pub async fn is_configured(&self) -> bool {
        self.tsk.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_is_enforced() {
        assert!(TrafficSessionKey::from_slice(&[1u8; KEY_LEN]).is_ok());
        assert!(matches!(
            TrafficSessionKey::from_slice(&[1u8; 31]),
            Err(EnclaveError::InvalidKeyMaterial(31))
        ));
        assert!(matches!(
            TrafficSessionKey::from_slice(&[1u8; 33]),
            Err(EnclaveError::InvalidKeyMaterial(33))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = TrafficSessionKey::from_slice(&[0xab; KEY_LEN]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("ab"));
        assert!(!rendered.contains("171"));
    }

    #[tokio::test]
    async fn test_starts_unconfigured() {
        let state = EnclaveConfigurationState::new();
        assert!(!state.is_configured().await);
        assert!(state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_survives_replacement() {
        let state = EnclaveConfigurationState::new();
        state
            .install(TrafficSessionKey::from_slice(&[1u8; KEY_LEN]).unwrap())
            .await;

        let captured = state.snapshot().await.unwrap();
        state
            .install(TrafficSessionKey::from_slice(&[2u8; KEY_LEN]).unwrap())
            .await;

        assert_eq!(captured.as_bytes(), &[1u8; KEY_LEN]);
        assert_eq!(state.snapshot().await.unwrap().as_bytes(), &[2u8; KEY_LEN]);
    }
}
