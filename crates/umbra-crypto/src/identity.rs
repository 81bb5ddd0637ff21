//! Peer identities: Ed25519 keys and their digest-derived names.
//!
//! A peer is named by the BLAKE3-512 digest of its Ed25519 public key.
//! Hello records and signed blocks carry the public key alongside the
//! signature so that receivers can verify without a prior exchange.
//!
//! This module wraps `ed25519-dalek` and `x25519-dalek` with Umbra-specific
//! types.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::hash::HashCode;
use crate::{CryptoError, Result};

/// A peer identity: the 512-bit digest of an Ed25519 public key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerId(pub HashCode);

impl PeerId {
    /// Derive the identity for a public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        PeerId(HashCode::compute(key.as_bytes()))
    }

    /// XOR distance to another identity.
    pub fn distance(&self, other: &PeerId) -> HashCode {
        self.0.distance(&other.0)
    }

    /// Short hex prefix for log output.
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

/// An Ed25519 signing key (private key).
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&self.inner.to_bytes()),
        }
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

/// An Ed25519 verification key (public key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

/// An Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

/// Signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// The full key material of a node.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a signing key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Get the raw bytes of this signing key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the corresponding verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message. The signature covers exactly the bytes given.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

impl VerifyingKey {
    /// Create a verifying key from raw bytes.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Get the raw bytes of this verifying key.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.to_bytes()
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.inner.as_bytes()
    }

    /// Verify a signature on a message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] on mismatch. Callers
    /// that use verification for authentication must treat the error as hard
    /// failure and drop the input.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.inner
            .verify(message, &signature.inner)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    /// Get the raw bytes of this signature.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.inner.to_bytes()
    }
}

impl KeyPair {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate();
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create a keypair from a signing key's raw bytes.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The identity this keypair names.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.verifying_key)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.verifying_key())
            .finish()
    }
}

/// An X25519 secret for session-key agreement.
pub struct AgreementSecret {
    inner: x25519_dalek::StaticSecret,
}

/// An X25519 public key for session-key agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementPublic {
    inner: x25519_dalek::PublicKey,
}

impl AgreementSecret {
    /// Generate a new random agreement secret.
    pub fn generate() -> Self {
        Self {
            inner: x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: x25519_dalek::StaticSecret::from(bytes),
        }
    }

    /// Raw bytes of the secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// The corresponding public key.
    pub fn public(&self) -> AgreementPublic {
        AgreementPublic {
            inner: x25519_dalek::PublicKey::from(&self.inner),
        }
    }

    /// Compute the shared digest with a remote public key.
    ///
    /// Both sides of an exchange reach the same digest, which seeds the
    /// session key and IV derivation.
    pub fn shared_digest(&self, remote: &AgreementPublic) -> HashCode {
        let shared = self.inner.diffie_hellman(&remote.inner);
        HashCode::compute(shared.as_bytes())
    }
}

impl AgreementPublic {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: x25519_dalek::PublicKey::from(bytes),
        }
    }

    /// Raw bytes of the public key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let msg = b"umbra hello record";
        let sig = kp.signing_key.sign(msg);
        assert!(kp.verifying_key.verify(msg, &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let kp = KeyPair::generate();
        let sig = kp.signing_key.sign(b"correct");
        assert!(kp.verifying_key.verify(b"wrong", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let sig = kp1.signing_key.sign(b"test");
        assert!(kp2.verifying_key.verify(b"test", &sig).is_err());
    }

    #[test]
    fn test_peer_id_deterministic() {
        let kp = KeyPair::generate();
        let id1 = kp.peer_id();
        let id2 = PeerId::from_public_key(&kp.verifying_key);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_keypair_from_seed() {
        let seed = [7u8; 32];
        let kp1 = KeyPair::from_bytes(&seed);
        let kp2 = KeyPair::from_bytes(&seed);
        assert_eq!(kp1.verifying_key, kp2.verifying_key);
        assert_ne!(
            kp1.verifying_key,
            KeyPair::from_bytes(&[8u8; 32]).verifying_key
        );
    }

    #[test]
    fn test_signature_serialization() {
        let kp = KeyPair::generate();
        let sig = kp.signing_key.sign(b"test");
        let restored = Signature::from_bytes(&sig.to_bytes());
        assert_eq!(sig, restored);
    }

    #[test]
    fn test_agreement_shared_digest() {
        let a = AgreementSecret::generate();
        let b = AgreementSecret::generate();
        let ab = a.shared_digest(&b.public());
        let ba = b.shared_digest(&a.public());
        assert_eq!(ab, ba);

        let c = AgreementSecret::generate();
        assert_ne!(ab, a.shared_digest(&c.public()));
    }
}
