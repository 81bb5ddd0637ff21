//! Hello records: signed peer-address advertisements.
//!
//! A hello binds a peer identity to a transport address with an expiry.
//! Peers create hellos about themselves, transmit them at any time, and
//! cache the hellos of others after verification. Exactly one current hello
//! per (identity, transport) pair is retained by receivers.
//!
//! ## Wire format
//!
//! ```text
//! total_size   u16     size of the whole record
//! signature    64 B    Ed25519 over everything from subject onward
//! public_key   32 B    signer's Ed25519 public key
//! subject      64 B    peer identity (digest of public_key)
//! expiration   u64     seconds since the Unix epoch
//! address_size u16
//! protocol     u16     transport protocol number
//! mtu          u32     transport MTU, 0 = unbounded
//! address      address_size bytes, transport-specific
//! ```
//!
//! All integers network byte order. The signature covers `subject` onward.

use umbra_crypto::identity::{
    KeyPair, Signature, VerifyingKey, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use umbra_crypto::PeerId;

use crate::wire::{Reader, Writer};
use crate::{ProtoError, Result};

/// Fixed part of the record before the address bytes.
pub const HELLO_HEADER_LEN: usize = 2 + SIGNATURE_LEN + PUBLIC_KEY_LEN + 64 + 8 + 2 + 2 + 4;

/// Ceiling on the transport-specific address blob.
pub const MAX_ADDRESS_LEN: usize = 512;

/// A verified or self-created hello record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub signature: Signature,
    pub public_key: VerifyingKey,
    pub subject: PeerId,
    /// Seconds since the Unix epoch.
    pub expiration: u64,
    /// Transport protocol number.
    pub protocol: u16,
    /// Transport MTU; 0 means unbounded.
    pub mtu: u32,
    /// Transport-specific address bytes.
    pub address: Vec<u8>,
}

impl Hello {
    /// Create and sign a hello about ourselves.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Oversize`] if the address blob exceeds
    /// [`MAX_ADDRESS_LEN`].
    pub fn create(
        keys: &KeyPair,
        protocol: u16,
        mtu: u32,
        expiration: u64,
        address: Vec<u8>,
    ) -> Result<Self> {
        if address.len() > MAX_ADDRESS_LEN {
            return Err(ProtoError::Oversize {
                size: address.len(),
            });
        }
        let subject = keys.peer_id();
        let signed = signed_bytes(&subject, expiration, protocol, mtu, &address);
        let signature = keys.signing_key.sign(&signed);
        Ok(Self {
            signature,
            public_key: keys.verifying_key.clone(),
            subject,
            expiration,
            protocol,
            mtu,
            address,
        })
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = HELLO_HEADER_LEN + self.address.len();
        let mut w = Writer::with_capacity(total);
        w.u16(total as u16)
            .bytes(&self.signature.to_bytes())
            .bytes(self.public_key.as_bytes())
            .peer_id(&self.subject)
            .u64(self.expiration)
            .u16(self.address.len() as u16)
            .u16(self.protocol)
            .u32(self.mtu)
            .bytes(&self.address);
        w.into_bytes()
    }

    /// Parse a hello from the wire without verifying the signature.
    ///
    /// Receivers must call [`verify`](Self::verify) before caching.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let total = r.u16()? as usize;
        if total != buf.len() {
            return Err(ProtoError::Malformed(format!(
                "hello size field {total} does not match buffer {}",
                buf.len()
            )));
        }
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(r.take(SIGNATURE_LEN)?);
        let mut pk = [0u8; PUBLIC_KEY_LEN];
        pk.copy_from_slice(r.take(PUBLIC_KEY_LEN)?);
        let subject = r.peer_id()?;
        let expiration = r.u64()?;
        let address_size = r.u16()? as usize;
        let protocol = r.u16()?;
        let mtu = r.u32()?;
        if address_size > MAX_ADDRESS_LEN {
            return Err(ProtoError::Oversize { size: address_size });
        }
        let address = r.take(address_size)?.to_vec();
        r.finish()?;
        Ok(Self {
            signature: Signature::from_bytes(&sig),
            public_key: VerifyingKey::from_bytes(&pk)?,
            subject,
            expiration,
            protocol,
            mtu,
            address,
        })
    }

    /// Verify the record: the subject must be the digest of the embedded
    /// public key, the signature must cover `subject` onward, and the
    /// expiration must not have passed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadSignature`] on identity or signature
    /// mismatch and [`ProtoError::Malformed`] on expiry.
    pub fn verify(&self, now_secs: u64) -> Result<()> {
        if PeerId::from_public_key(&self.public_key) != self.subject {
            return Err(ProtoError::BadSignature);
        }
        let signed = signed_bytes(
            &self.subject,
            self.expiration,
            self.protocol,
            self.mtu,
            &self.address,
        );
        self.public_key
            .verify(&signed, &self.signature)
            .map_err(|_| ProtoError::BadSignature)?;
        if self.expiration <= now_secs {
            return Err(ProtoError::Malformed("hello expired".to_string()));
        }
        Ok(())
    }
}

/// The byte range covered by the signature: subject onward.
fn signed_bytes(
    subject: &PeerId,
    expiration: u64,
    protocol: u16,
    mtu: u32,
    address: &[u8],
) -> Vec<u8> {
    let mut w = Writer::with_capacity(64 + 8 + 2 + 2 + 4 + address.len());
    w.peer_id(subject)
        .u64(expiration)
        .u16(address.len() as u16)
        .u16(protocol)
        .u32(mtu)
        .bytes(address);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (KeyPair, Hello) {
        let keys = KeyPair::generate();
        let hello = Hello::create(&keys, 7, 1400, 10_000, b"127.0.0.1:4433".to_vec())
            .expect("create");
        (keys, hello)
    }

    #[test]
    fn test_roundtrip() {
        let (_, hello) = sample();
        let bytes = hello.to_bytes();
        let parsed = Hello::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, hello);
    }

    #[test]
    fn test_verify_ok() {
        let (_, hello) = sample();
        assert!(hello.verify(9_999).is_ok());
    }

    #[test]
    fn test_expired_rejected() {
        let (_, hello) = sample();
        assert!(hello.verify(10_000).is_err());
    }

    #[test]
    fn test_tampered_address_rejected() {
        let (_, mut hello) = sample();
        hello.address = b"10.0.0.1:4433\0".to_vec();
        assert!(matches!(hello.verify(0), Err(ProtoError::BadSignature)));
    }

    #[test]
    fn test_tampered_mtu_rejected() {
        let (_, mut hello) = sample();
        hello.mtu = 9000;
        assert!(hello.verify(0).is_err());
    }

    #[test]
    fn test_wrong_subject_rejected() {
        let (_, mut hello) = sample();
        let other = KeyPair::generate();
        hello.subject = other.peer_id();
        assert!(hello.verify(0).is_err());
    }

    #[test]
    fn test_size_field_mismatch_rejected() {
        let (_, hello) = sample();
        let mut bytes = hello.to_bytes();
        bytes.push(0);
        assert!(Hello::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversize_address_rejected() {
        let keys = KeyPair::generate();
        let result = Hello::create(&keys, 1, 0, 1, vec![0u8; MAX_ADDRESS_LEN + 1]);
        assert!(result.is_err());
    }
}
