//! 512-bit BLAKE3 digests and the XOR-distance metric.
//!
//! A single digest type serves both peer identities and content queries:
//! routing in the DHT and in the anonymous file-sharing layer is defined over
//! XOR distance between digests, compared lexicographically.
//!
//! Key derivation uses BLAKE3's built-in `derive_key` mode with registered
//! context strings; an unregistered context string is a protocol violation.

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CryptoError, Result};

/// Width of a digest in bytes.
pub const HASH_LEN: usize = 64;

/// Registered BLAKE3 context strings. Using an unregistered context string
/// is a protocol violation.
pub mod contexts {
    pub const SESSION_KEY: &str = "Umbra v1 session-key";
    pub const SESSION_NONCE: &str = "Umbra v1 session-nonce";
    pub const CONTENT_KEY: &str = "Umbra v1 content-key";
    pub const CONTENT_NONCE: &str = "Umbra v1 content-nonce";
    pub const KEYWORD_KEY: &str = "Umbra v1 keyword-key";
    pub const BLOOM_INDEX: &str = "Umbra v1 bloom-index";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        SESSION_KEY,
        SESSION_NONCE,
        CONTENT_KEY,
        CONTENT_NONCE,
        KEYWORD_KEY,
        BLOOM_INDEX,
    ];
}

/// A 512-bit digest.
///
/// Equality and total ordering are bitwise. The distance between two digests
/// is their bitwise XOR, compared lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashCode(pub [u8; HASH_LEN]);

impl HashCode {
    /// The all-zero digest (identifies the master DHT table).
    pub const ZERO: HashCode = HashCode([0u8; HASH_LEN]);

    /// Compute the BLAKE3-512 digest of the input.
    pub fn compute(data: &[u8]) -> Self {
        let mut out = [0u8; HASH_LEN];
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        hasher.finalize_xof().fill(&mut out);
        HashCode(out)
    }

    /// Parse a digest from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] unless exactly 64 bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH_LEN {
            return Err(CryptoError::InvalidInput(format!(
                "digest must be {HASH_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Ok(HashCode(out))
    }

    /// Raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Bitwise XOR distance to another digest.
    pub fn distance(&self, other: &HashCode) -> HashCode {
        let mut out = [0u8; HASH_LEN];
        for i in 0..HASH_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        HashCode(out)
    }

    /// Number of leading zero bits, or `None` if the digest is all zeros.
    pub fn leading_zeros(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    /// The value of bit `i`, counting from the most significant bit.
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < HASH_LEN * 8);
        (self.0[i / 8] >> (7 - (i % 8))) & 1 == 1
    }

    /// Compare which of `a` and `b` is closer to `target` by XOR distance.
    ///
    /// Returns `Ordering::Less` when `a` is strictly closer.
    pub fn distance_cmp(
        a: &HashCode,
        b: &HashCode,
        target: &HashCode,
    ) -> std::cmp::Ordering {
        a.distance(target).cmp(&b.distance(target))
    }

    /// Short hex prefix for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for HashCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashCode({}..)", self.short())
    }
}

impl std::fmt::Display for HashCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct HashCodeVisitor;

impl<'de> Visitor<'de> for HashCodeVisitor {
    type Value = HashCode;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{HASH_LEN} bytes")
    }

    fn visit_bytes<E: DeError>(self, v: &[u8]) -> std::result::Result<HashCode, E> {
        HashCode::from_slice(v).map_err(E::custom)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<HashCode, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut out = [0u8; HASH_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| A::Error::invalid_length(i, &self))?;
        }
        Ok(HashCode(out))
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_bytes(HashCodeVisitor)
    }
}

/// Derive a 32-byte key from keying material using BLAKE3's key derivation
/// mode under a registered context string.
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    debug_assert!(contexts::ALL_CONTEXTS.contains(&context));
    blake3::derive_key(context, material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_deterministic() {
        let a = HashCode::compute(b"umbra");
        let b = HashCode::compute(b"umbra");
        assert_eq!(a, b);
        assert_ne!(a, HashCode::compute(b"umbral"));
    }

    #[test]
    fn test_distance_symmetry() {
        let a = HashCode::compute(b"a");
        let b = HashCode::compute(b"b");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), HashCode::ZERO);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(HashCode::ZERO.leading_zeros(), None);

        let mut v = [0u8; HASH_LEN];
        v[0] = 0x80;
        assert_eq!(HashCode(v).leading_zeros(), Some(0));

        v[0] = 0x01;
        assert_eq!(HashCode(v).leading_zeros(), Some(7));

        let mut w = [0u8; HASH_LEN];
        w[1] = 0x01;
        assert_eq!(HashCode(w).leading_zeros(), Some(15));
    }

    #[test]
    fn test_bit_indexing() {
        let mut v = [0u8; HASH_LEN];
        v[0] = 0b1010_0000;
        let h = HashCode(v);
        assert!(h.bit(0));
        assert!(!h.bit(1));
        assert!(h.bit(2));
        assert!(!h.bit(3));
    }

    #[test]
    fn test_distance_cmp() {
        let target = HashCode::compute(b"target");
        let mut near = target;
        near.0[63] ^= 0x01;
        let mut far = target;
        far.0[0] ^= 0x80;
        assert_eq!(
            HashCode::distance_cmp(&near, &far, &target),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn test_from_slice_rejects_bad_length() {
        assert!(HashCode::from_slice(&[0u8; 32]).is_err());
        assert!(HashCode::from_slice(&[0u8; 64]).is_ok());
    }

    #[test]
    fn test_derive_key_deterministic() {
        let k1 = derive_key(contexts::SESSION_KEY, b"shared");
        let k2 = derive_key(contexts::SESSION_KEY, b"shared");
        assert_eq!(k1, k2);
        let k3 = derive_key(contexts::SESSION_NONCE, b"shared");
        assert_ne!(k1, k3);
    }
}
