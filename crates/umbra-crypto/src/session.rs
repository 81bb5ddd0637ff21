//! Symmetric session encryption for peer-to-peer frames.
//!
//! Two peers that share a digest (from X25519 agreement) derive the same
//! (key, IV) pair deterministically. Frames are sealed with
//! ChaCha20-Poly1305; the per-frame nonce mixes the IV with a sequence
//! number so that a key is never reused with the same nonce.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::hash::{contexts, derive_key, HashCode};
use crate::{CryptoError, Result};

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// A derived session key and IV.
///
/// Deterministic: any two peers sharing the seed digest reach the same pair.
pub struct SessionKey {
    key: Key,
    iv: [u8; NONCE_LEN],
}

impl SessionKey {
    /// Derive a session key and IV from a shared digest.
    pub fn derive(shared: &HashCode) -> Self {
        let key_bytes = derive_key(contexts::SESSION_KEY, shared.as_bytes());
        let nonce_bytes = derive_key(contexts::SESSION_NONCE, shared.as_bytes());
        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(&nonce_bytes[..NONCE_LEN]);
        Self {
            key: Key::from(key_bytes),
            iv,
        }
    }

    /// Seal a frame under this key with the given sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] if the AEAD rejects the input.
    pub fn seal(&self, seq: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.key);
        let nonce = self.frame_nonce(seq);
        cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))
    }

    /// Open a frame sealed with [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if the key, sequence number or
    /// ciphertext do not match.
    pub fn open(&self, seq: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.key);
        let nonce = self.frame_nonce(seq);
        cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Mix the IV with a frame sequence number.
    fn frame_nonce(&self, seq: u64) -> Nonce {
        let mut nonce = self.iv;
        let seq_bytes = seq.to_be_bytes();
        for i in 0..8 {
            nonce[NONCE_LEN - 8 + i] ^= seq_bytes[i];
        }
        Nonce::from(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let shared = HashCode::compute(b"shared secret");
        let k1 = SessionKey::derive(&shared);
        let k2 = SessionKey::derive(&shared);
        let sealed = k1.seal(1, b"frame").expect("seal");
        let opened = k2.open(1, &sealed).expect("open");
        assert_eq!(opened, b"frame");
    }

    #[test]
    fn test_wrong_seq_fails() {
        let key = SessionKey::derive(&HashCode::compute(b"s"));
        let sealed = key.seal(1, b"frame").expect("seal");
        assert!(key.open(2, &sealed).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let k1 = SessionKey::derive(&HashCode::compute(b"s1"));
        let k2 = SessionKey::derive(&HashCode::compute(b"s2"));
        let sealed = k1.seal(0, b"frame").expect("seal");
        assert!(k2.open(0, &sealed).is_err());
    }

    #[test]
    fn test_tamper_detected() {
        let key = SessionKey::derive(&HashCode::compute(b"s"));
        let mut sealed = key.seal(0, b"frame").expect("seal");
        sealed[0] ^= 0xFF;
        assert!(key.open(0, &sealed).is_err());
    }

    #[test]
    fn test_ciphertext_length() {
        let key = SessionKey::derive(&HashCode::compute(b"s"));
        let sealed = key.seal(0, b"12345").expect("seal");
        assert_eq!(sealed.len(), 5 + TAG_LEN);
    }
}
