//! # umbra-crypto
//!
//! Cryptographic primitives shared by every Umbra subsystem.
//!
//! This crate implements:
//! - 512-bit BLAKE3 digests with the XOR-distance metric used for both
//!   peer identities and content queries
//! - Ed25519 signing and verification for peer identities and hello records
//! - X25519 key agreement feeding the session-key derivation
//! - ChaCha20-Poly1305 sealing for encrypted peer-to-peer frames
//! - CHK content encryption: a block is encrypted under the hash of its own
//!   plaintext, so only a requester who already knows the hash can decrypt
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Digest width | 512 bits (BLAKE3 XOF) |
//! | Signature scheme | Ed25519 (RFC 8032) |
//! | Session AEAD | ChaCha20-Poly1305, 12-byte nonce |
//! | Peer identity | `BLAKE3-512(ed25519_public_key)` |

pub mod content;
pub mod hash;
pub mod identity;
pub mod session;

pub use hash::HashCode;
pub use identity::PeerId;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Input bytes do not form a valid key, signature or digest.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A signature did not verify against the claimed key.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (wrong key or tampered ciphertext).
    #[error("decryption failed")]
    Decryption,

    /// Decrypted plaintext does not hash back to the content key.
    #[error("content key mismatch")]
    KeyMismatch,
}

/// Convenience result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
