//! XChaCha20-Poly1305 sealing of fee values and tags

use crate::error::SealError;
use crate::ports::EncryptionService;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use pipeline_types::Sealed;
use rand::RngCore;

/// Symmetric sealer used as the in-process encryption service
#[derive(Clone)]
pub struct FeeSealer {
    cipher: XChaCha20Poly1305,
}

impl FeeSealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new((&key).into()),
        }
    }

    /// Sealer with a random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, SealError> {
        self.cipher
            .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|e| SealError::DecryptionFailed(e.to_string()))
    }

    /// Open a value sealed with `seal_amount`
    pub fn open_amount(&self, sealed: &Sealed) -> Result<u64, SealError> {
        let bytes = self.open(sealed)?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::DecryptionFailed(format!("expected 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_le_bytes(raw))
    }
}

impl EncryptionService for FeeSealer {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, SealError> {
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| SealError::EncryptionFailed(e.to_string()))?;

        Ok(Sealed { nonce, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::seal_amount;

    #[test]
    fn test_seal_and_open_amount() {
        let sealer = FeeSealer::generate();
        let sealed = seal_amount(&sealer, 4_242).unwrap();
        assert_ne!(sealed.ciphertext, 4_242u64.to_le_bytes().to_vec());
        assert_eq!(sealer.open_amount(&sealed).unwrap(), 4_242);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = FeeSealer::new([1u8; 32]).encrypt(b"fee").unwrap();
        assert!(FeeSealer::new([2u8; 32]).open(&sealed).is_err());
    }
}
