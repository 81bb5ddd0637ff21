//! CHK content encryption.
//!
//! A content block is encrypted under the digest of its own plaintext: the
//! key of a block is `H(plaintext)`, and the routing query is
//! `H(ciphertext || type)`. Anyone holding the ciphertext cannot read it;
//! anyone who already knows the plaintext hash can fetch by query and
//! decrypt. Encryption is deterministic so that identical plaintext blocks
//! converge to identical ciphertext on every peer.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::hash::{contexts, derive_key, HashCode};
use crate::{CryptoError, Result};

/// A content-hash key: the decryption key and routing query of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey {
    /// `H(plaintext)`: decrypts the block.
    pub key: HashCode,
    /// `H(ciphertext || type)`: routes requests for the block.
    pub query: HashCode,
}

/// Encrypt a block under the digest of its own plaintext.
///
/// Returns the [`ContentKey`] and the ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidInput`] if the AEAD rejects the input.
pub fn encode_block(plaintext: &[u8], block_type: u16) -> Result<(ContentKey, Vec<u8>)> {
    let key = HashCode::compute(plaintext);
    let ciphertext = seal_under(&key, plaintext)?;
    let query = query_for(&ciphertext, block_type);
    Ok((ContentKey { key, query }, ciphertext))
}

/// Decrypt a block with its content key and verify the plaintext hashes
/// back to the key.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] if decryption fails and
/// [`CryptoError::KeyMismatch`] if the plaintext does not match the key.
pub fn decode_block(ciphertext: &[u8], key: &HashCode) -> Result<Vec<u8>> {
    let cipher = chk_cipher(key);
    let nonce = chk_nonce(key);
    let plaintext = cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::Decryption)?;
    if HashCode::compute(&plaintext) != *key {
        return Err(CryptoError::KeyMismatch);
    }
    Ok(plaintext)
}

/// Encrypt a block under a caller-chosen key digest instead of the
/// plaintext hash. Keyword and namespace blocks use this: their key is the
/// hash of the keyword or identifier, so decryption does not imply knowing
/// the plaintext in advance.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidInput`] if the AEAD rejects the input.
pub fn encode_block_with_key(
    plaintext: &[u8],
    key: &HashCode,
    block_type: u16,
) -> Result<(ContentKey, Vec<u8>)> {
    let ciphertext = seal_under(key, plaintext)?;
    let query = query_for(&ciphertext, block_type);
    Ok((ContentKey { key: *key, query }, ciphertext))
}

/// Decrypt a block sealed with [`encode_block_with_key`]. No plaintext
/// hash check applies; the AEAD tag authenticates the ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] on key or tag mismatch.
pub fn decode_block_with_key(ciphertext: &[u8], key: &HashCode) -> Result<Vec<u8>> {
    let cipher = chk_cipher(key);
    let nonce = chk_nonce(key);
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Recompute the routing query for a ciphertext.
pub fn query_for(ciphertext: &[u8], block_type: u16) -> HashCode {
    let mut buf = Vec::with_capacity(ciphertext.len() + 2);
    buf.extend_from_slice(ciphertext);
    buf.extend_from_slice(&block_type.to_be_bytes());
    HashCode::compute(&buf)
}

fn seal_under(key: &HashCode, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = chk_cipher(key);
    let nonce = chk_nonce(key);
    cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))
}

fn chk_cipher(key: &HashCode) -> ChaCha20Poly1305 {
    let key_bytes = derive_key(contexts::CONTENT_KEY, key.as_bytes());
    ChaCha20Poly1305::new(&Key::from(key_bytes))
}

fn chk_nonce(key: &HashCode) -> Nonce {
    let nonce_bytes = derive_key(contexts::CONTENT_NONCE, key.as_bytes());
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_bytes[..12]);
    Nonce::from(nonce)
}
