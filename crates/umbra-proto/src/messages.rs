//! Typed peer-to-peer messages and the message-type registry.
//!
//! Each sub-message type defined by the overlay protocol has a struct here
//! with explicit big-endian `to_bytes`/`from_bytes`. Unknown type codes are
//! ignored by the dispatcher with a counter increment.

use umbra_crypto::{HashCode, PeerId};

use crate::wire::{Reader, Writer};
use crate::{ProtoError, Result, MAX_MESSAGE_SIZE};

// ---------------------------------------------------------------------------
// Message type constants
// ---------------------------------------------------------------------------

/// Message type for a hello record (0x0001).
pub const MSG_HELLO: u16 = 0x0001;
/// Message type for ping (0x0002).
pub const MSG_PING: u16 = 0x0002;
/// Message type for pong (0x0003).
pub const MSG_PONG: u16 = 0x0003;
/// Message type for noise/keepalive padding (0x0004).
pub const MSG_NOISE: u16 = 0x0004;
/// Message type for the session key exchange (0x0005).
pub const MSG_KEY_EXCHANGE: u16 = 0x0005;

/// Message type for a content query (0x0010).
pub const MSG_QUERY: u16 = 0x0010;
/// Message type for a CHK reply (0x0011).
pub const MSG_CHK_REPLY: u16 = 0x0011;
/// Message type for a 3HASH keyword reply (0x0012).
pub const MSG_3HASH_REPLY: u16 = 0x0012;
/// Message type for a signed-block reply (0x0013).
pub const MSG_SBLOCK_REPLY: u16 = 0x0013;
/// Message type for a namespace query (0x0014).
pub const MSG_NS_QUERY: u16 = 0x0014;
/// Message type for a namespace reply (0x0015).
pub const MSG_NS_REPLY: u16 = 0x0015;

/// Message type for a message fragment (0x0020).
pub const MSG_FRAGMENT: u16 = 0x0020;

/// Message type for an RPC request (0x0030).
pub const MSG_RPC_REQ: u16 = 0x0030;
/// Message type for an RPC reply (0x0031).
pub const MSG_RPC_RES: u16 = 0x0031;

// ---------------------------------------------------------------------------
// Ping / pong
// ---------------------------------------------------------------------------

/// Liveness probe. The receiver echoes the nonce in a [`Pong`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

impl Ping {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.u64(self.nonce);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let nonce = r.u64()?;
        r.finish()?;
        Ok(Self { nonce })
    }
}

/// Echo of a [`Ping`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

impl Pong {
    pub fn to_bytes(&self) -> Vec<u8> {
        Ping { nonce: self.nonce }.to_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            nonce: Ping::from_bytes(buf)?.nonce,
        })
    }
}

// ---------------------------------------------------------------------------
// Session key exchange
// ---------------------------------------------------------------------------

/// One side's half of the session key exchange.
///
/// Carries an ephemeral X25519 public key signed by the sender's identity
/// key. Both sides combine their ephemeral secret with the other's public
/// key into a shared digest, from which the session key and IV derive
/// deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyExchange {
    /// Sender's Ed25519 public key (names the sender).
    pub public_key: [u8; 32],
    /// Ephemeral X25519 public key for this session.
    pub agreement_public: [u8; 32],
    /// Ed25519 signature over `agreement_public`.
    pub signature: [u8; 64],
}

impl KeyExchange {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32 + 32 + 64);
        w.bytes(&self.public_key)
            .bytes(&self.agreement_public)
            .bytes(&self.signature);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(r.take(32)?);
        let mut agreement_public = [0u8; 32];
        agreement_public.copy_from_slice(r.take(32)?);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(r.take(64)?);
        r.finish()?;
        Ok(Self {
            public_key,
            agreement_public,
            signature,
        })
    }

    /// Verify the signature and return the sender identity it names.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadSignature`] on any mismatch; callers drop
    /// the message.
    pub fn verify(&self) -> Result<PeerId> {
        let vk = umbra_crypto::identity::VerifyingKey::from_bytes(&self.public_key)?;
        let sig = umbra_crypto::identity::Signature::from_bytes(&self.signature);
        vk.verify(&self.agreement_public, &sig)
            .map_err(|_| ProtoError::BadSignature)?;
        Ok(PeerId::from_public_key(&vk))
    }
}

// ---------------------------------------------------------------------------
// Content queries
// ---------------------------------------------------------------------------

/// A routed content query: one or more query digests sharing a priority, a
/// TTL and a reply path.
///
/// Several sub-queries in one message form a super-query; the effective
/// per-sub-query priority is the total divided by the count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    /// Priority the originator is willing to pay.
    pub priority: u32,
    /// Remaining time-to-live; may legitimately be negative in flight.
    pub ttl: i32,
    /// Peer the reply should be routed back to.
    pub return_to: PeerId,
    /// The query digests.
    pub queries: Vec<HashCode>,
}

impl Query {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + 4 + 64 + self.queries.len() * 64);
        w.u32(self.priority).i32(self.ttl).peer_id(&self.return_to);
        for q in &self.queries {
            w.hash(q);
        }
        w.into_bytes()
    }

    /// Parse and validate: at least one sub-query, and the byte count must
    /// fall exactly on a digest boundary.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let priority = r.u32()?;
        let ttl = r.i32()?;
        let return_to = r.peer_id()?;
        let rest = r.remaining();
        if rest == 0 || rest % 64 != 0 {
            return Err(ProtoError::Malformed(format!(
                "query digest bytes {rest} not a positive multiple of 64"
            )));
        }
        let mut queries = Vec::with_capacity(rest / 64);
        for _ in 0..rest / 64 {
            queries.push(r.hash()?);
        }
        Ok(Self {
            priority,
            ttl,
            return_to,
            queries,
        })
    }
}

/// A namespace query: searches one namespace for one identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NsQuery {
    pub priority: u32,
    pub ttl: i32,
    pub return_to: PeerId,
    /// Digest of the namespace public key.
    pub namespace: HashCode,
    /// Routing identifier inside the namespace.
    pub identifier: HashCode,
}

impl NsQuery {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + 4 + 64 * 3);
        w.u32(self.priority)
            .i32(self.ttl)
            .peer_id(&self.return_to)
            .hash(&self.namespace)
            .hash(&self.identifier);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let priority = r.u32()?;
        let ttl = r.i32()?;
        let return_to = r.peer_id()?;
        let namespace = r.hash()?;
        let identifier = r.hash()?;
        r.finish()?;
        Ok(Self {
            priority,
            ttl,
            return_to,
            namespace,
            identifier,
        })
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A CHK reply: the encrypted block itself plus its block-kind tag. The
/// query hash is recomputed by the receiver as `H(data || kind)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChkReply {
    /// Block kind the ciphertext claims (data or inode).
    pub kind: u16,
    pub data: Vec<u8>,
}

impl ChkReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(2 + self.data.len());
        w.u16(self.kind).bytes(&self.data);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let kind = r.u16()?;
        let data = r.rest().to_vec();
        if data.is_empty() {
            return Err(ProtoError::Malformed("empty CHK reply".to_string()));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::Oversize { size: data.len() });
        }
        Ok(Self { kind, data })
    }
}

/// A keyword-search reply. Carries the double hash `H(keyword)` so the
/// receiver can recompute the triple-hash query, plus the keyword block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreeHashReply {
    /// `H(keyword)`; the routing query is `H(H(keyword))`.
    pub double_hash: HashCode,
    pub data: Vec<u8>,
}

impl ThreeHashReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(64 + self.data.len());
        w.hash(&self.double_hash).bytes(&self.data);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let double_hash = r.hash()?;
        let data = r.rest().to_vec();
        if data.is_empty() {
            return Err(ProtoError::Malformed("empty 3HASH reply".to_string()));
        }
        Ok(Self { double_hash, data })
    }
}

/// A signed-block reply (namespace content). The payload is a serialized
/// signed block; the routing identifier and signature live inside it and
/// are checked by the file-sharing layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SBlockReply {
    pub data: Vec<u8>,
}

impl SBlockReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(ProtoError::Malformed("empty signed-block reply".to_string()));
        }
        Ok(Self { data: buf.to_vec() })
    }
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// One fragment of a message larger than the session MTU.
///
/// Fragments of one message share `id` and `total`; offsets partition
/// `[0, total)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Random 32-bit message id.
    pub id: u32,
    /// Offset of this fragment's payload in the original message.
    pub offset: u16,
    /// Total length of the original message.
    pub total: u16,
    pub payload: Vec<u8>,
}

/// Fixed part of a fragment before the payload.
pub const FRAGMENT_HEADER_LEN: usize = 4 + 2 + 2;

impl Fragment {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        w.u32(self.id)
            .u16(self.offset)
            .u16(self.total)
            .bytes(&self.payload);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let id = r.u32()?;
        let offset = r.u16()?;
        let total = r.u16()?;
        let payload = r.rest().to_vec();
        if payload.is_empty() {
            return Err(ProtoError::Malformed("empty fragment".to_string()));
        }
        Ok(Self {
            id,
            offset,
            total,
            payload,
        })
    }

    /// Exclusive end offset of this fragment.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] if `offset + len` overflows the
    /// 16-bit range: a fragment like that is discarded.
    pub fn end(&self) -> Result<u16> {
        let end = self.offset as u32 + self.payload.len() as u32;
        if end > u16::MAX as u32 {
            return Err(ProtoError::Malformed("fragment end overflows".to_string()));
        }
        Ok(end as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::identity::KeyPair;

    fn pid() -> PeerId {
        KeyPair::from_bytes(&[1u8; 32]).peer_id()
    }

    #[test]
    fn test_ping_roundtrip() {
        let p = Ping { nonce: 77 };
        assert_eq!(Ping::from_bytes(&p.to_bytes()).expect("parse"), p);
        assert!(Ping::from_bytes(&[0u8; 7]).is_err());
        assert!(Ping::from_bytes(&[0u8; 9]).is_err());
    }

    #[test]
    fn test_key_exchange_roundtrip_and_verify() {
        let keys = KeyPair::generate();
        let eph = umbra_crypto::identity::AgreementSecret::generate();
        let agreement_public = eph.public().to_bytes();
        let kx = KeyExchange {
            public_key: keys.verifying_key.to_bytes(),
            agreement_public,
            signature: keys.signing_key.sign(&agreement_public).to_bytes(),
        };
        let parsed = KeyExchange::from_bytes(&kx.to_bytes()).expect("parse");
        assert_eq!(parsed, kx);
        assert_eq!(parsed.verify().expect("verify"), keys.peer_id());

        let mut tampered = kx;
        tampered.agreement_public[0] ^= 1;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_query_roundtrip() {
        let q = Query {
            priority: 4,
            ttl: -30,
            return_to: pid(),
            queries: vec![HashCode::compute(b"a"), HashCode::compute(b"b")],
        };
        let parsed = Query::from_bytes(&q.to_bytes()).expect("parse");
        assert_eq!(parsed, q);
    }

    #[test]
    fn test_query_must_have_subqueries() {
        let q = Query {
            priority: 1,
            ttl: 5,
            return_to: pid(),
            queries: vec![],
        };
        assert!(Query::from_bytes(&q.to_bytes()).is_err());
    }

    #[test]
    fn test_query_partial_digest_rejected() {
        let q = Query {
            priority: 1,
            ttl: 5,
            return_to: pid(),
            queries: vec![HashCode::compute(b"a")],
        };
        let mut bytes = q.to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(Query::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_ns_query_roundtrip() {
        let q = NsQuery {
            priority: 9,
            ttl: 120,
            return_to: pid(),
            namespace: HashCode::compute(b"ns"),
            identifier: HashCode::compute(b"id"),
        };
        assert_eq!(NsQuery::from_bytes(&q.to_bytes()).expect("parse"), q);
    }

    #[test]
    fn test_three_hash_reply_roundtrip() {
        let reply = ThreeHashReply {
            double_hash: HashCode::compute(b"keyword"),
            data: b"kblock bytes".to_vec(),
        };
        assert_eq!(
            ThreeHashReply::from_bytes(&reply.to_bytes()).expect("parse"),
            reply
        );
    }

    #[test]
    fn test_chk_reply_roundtrip() {
        let reply = ChkReply {
            kind: 1,
            data: b"ciphertext".to_vec(),
        };
        assert_eq!(ChkReply::from_bytes(&reply.to_bytes()).expect("parse"), reply);
    }

    #[test]
    fn test_empty_replies_rejected() {
        assert!(ChkReply::from_bytes(&[0, 1]).is_err());
        assert!(SBlockReply::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_fragment_roundtrip() {
        let f = Fragment {
            id: 0xDEAD_BEEF,
            offset: 1400,
            total: 5000,
            payload: vec![0x55; 1392],
        };
        assert_eq!(Fragment::from_bytes(&f.to_bytes()).expect("parse"), f);
        assert_eq!(f.end().expect("end"), 2792);
    }

    #[test]
    fn test_fragment_end_overflow() {
        let f = Fragment {
            id: 1,
            offset: u16::MAX,
            total: u16::MAX,
            payload: vec![0u8; 2],
        };
        assert!(f.end().is_err());
    }
}
