//! Content block types and their query derivation.
//!
//! Four block kinds make up shared content:
//!
//! - **Data blocks**: opaque byte runs up to 32 KiB, CHK-encrypted: the
//!   key is the hash of the plaintext, the query the hash of the
//!   ciphertext and type.
//! - **Inode blocks**: arrays of child content keys addressing further
//!   blocks, CHK-encrypted like data.
//! - **Keyword blocks**: advertise a file identifier under a keyword. The
//!   block is encrypted under `H(keyword)` and signed with a keypair
//!   derived from the keyword, so holders of the keyword can decrypt and
//!   anyone can check that the inserter knew it. Routed by the triple
//!   hash `H(H(H(keyword)))`.
//! - **Signed blocks**: namespace content: ciphertext under the hash of a
//!   chosen identifier, signed by the namespace key, routed by
//!   `R = H(namespace) ^ H(identifier)`.
//!
//! Query and decryption key are derivable from block plus type alone; no
//! side tables are needed to serve a block.

use umbra_crypto::content::{self, ContentKey};
use umbra_crypto::identity::{KeyPair, Signature, VerifyingKey};
use umbra_crypto::HashCode;
use umbra_proto::wire::{Reader, Writer};

use crate::{FsError, Result};

/// Kind tag of a data block.
pub const KIND_DATA: u16 = 1;
/// Kind tag of an inode block.
pub const KIND_INODE: u16 = 2;
/// Kind tag of a keyword block.
pub const KIND_KEYWORD: u16 = 3;
/// Kind tag of a namespace signed block.
pub const KIND_SIGNED: u16 = 4;

/// Largest plaintext block.
pub const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// Child keys per inode block.
pub const INODE_FANOUT: usize = 128;

// ---------------------------------------------------------------------------
// Data and inode blocks (CHK)
// ---------------------------------------------------------------------------

/// Encrypt a data block. Returns the content key and ciphertext.
///
/// # Errors
///
/// Returns [`FsError::BlockTooLarge`] above [`MAX_BLOCK_SIZE`].
pub fn encode_data_block(plaintext: &[u8]) -> Result<(ContentKey, Vec<u8>)> {
    if plaintext.len() > MAX_BLOCK_SIZE {
        return Err(FsError::BlockTooLarge {
            size: plaintext.len(),
        });
    }
    Ok(content::encode_block(plaintext, KIND_DATA)?)
}

/// Decrypt a data block with its key and verify it hashes back.
pub fn decode_data_block(ciphertext: &[u8], key: &HashCode) -> Result<Vec<u8>> {
    Ok(content::decode_block(ciphertext, key)?)
}

/// The routing query of a data-block ciphertext.
pub fn data_block_query(ciphertext: &[u8]) -> HashCode {
    content::query_for(ciphertext, KIND_DATA)
}

/// An inode block: ordered child keys addressing further blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeBlock {
    pub children: Vec<ContentKey>,
}

impl InodeBlock {
    /// Serialize and CHK-encrypt.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::BlockTooLarge`] with more than
    /// [`INODE_FANOUT`] children.
    pub fn encode(&self) -> Result<(ContentKey, Vec<u8>)> {
        if self.children.len() > INODE_FANOUT {
            return Err(FsError::BlockTooLarge {
                size: self.children.len() * 128,
            });
        }
        let mut w = Writer::with_capacity(self.children.len() * 128);
        for child in &self.children {
            w.hash(&child.key).hash(&child.query);
        }
        Ok(content::encode_block(&w.into_bytes(), KIND_INODE)?)
    }

    /// Decrypt and parse an inode block.
    pub fn decode(ciphertext: &[u8], key: &HashCode) -> Result<Self> {
        let plain = content::decode_block(ciphertext, key)?;
        if plain.len() % 128 != 0 {
            return Err(FsError::Malformed("inode block not key-aligned".to_string()));
        }
        let mut r = Reader::new(&plain);
        let mut children = Vec::with_capacity(plain.len() / 128);
        while r.remaining() > 0 {
            let key = r.hash()?;
            let query = r.hash()?;
            children.push(ContentKey { key, query });
        }
        Ok(Self { children })
    }
}

// ---------------------------------------------------------------------------
// Keyword blocks
// ---------------------------------------------------------------------------

/// The single hash of a keyword: decrypts keyword blocks.
pub fn keyword_hash(keyword: &str) -> HashCode {
    HashCode::compute(keyword.as_bytes())
}

/// The double hash: carried in replies so routers can re-derive the query.
pub fn keyword_double_hash(keyword: &str) -> HashCode {
    hash_of(&keyword_hash(keyword))
}

/// The triple hash: the routing query for a keyword search.
pub fn keyword_query(keyword: &str) -> HashCode {
    hash_of(&keyword_double_hash(keyword))
}

/// The query a router derives from a reply's double hash.
pub fn query_from_double_hash(double: &HashCode) -> HashCode {
    hash_of(double)
}

fn hash_of(h: &HashCode) -> HashCode {
    HashCode::compute(h.as_bytes())
}

/// The keypair every holder of a keyword can derive.
fn keyword_keypair(keyword: &str) -> KeyPair {
    let seed = keyword_hash(keyword);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&seed.as_bytes()[..32]);
    KeyPair::from_bytes(&secret)
}

/// A keyword block: an encrypted file identifier advertised under a
/// keyword.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywordBlock {
    /// Public half of the keyword-derived keypair.
    pub public_key: VerifyingKey,
    /// Signature over the ciphertext by the keyword-derived key.
    pub signature: Signature,
    /// File identifier and metadata, encrypted under `H(keyword)`.
    pub ciphertext: Vec<u8>,
}

impl KeywordBlock {
    /// Create a keyword block advertising `payload` under `keyword`.
    pub fn create(keyword: &str, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_BLOCK_SIZE {
            return Err(FsError::BlockTooLarge {
                size: payload.len(),
            });
        }
        let keys = keyword_keypair(keyword);
        // Convergent encryption under the keyword hash.
        let (_, ciphertext) = content::encode_block_with_key(
            payload,
            &keyword_hash(keyword),
            KIND_KEYWORD,
        )?;
        let signature = keys.signing_key.sign(&ciphertext);
        Ok(Self {
            public_key: keys.verifying_key,
            signature,
            ciphertext,
        })
    }

    /// Check the signature and that the public key matches the keyword
    /// space this block claims.
    pub fn verify(&self) -> Result<()> {
        self.public_key
            .verify(&self.ciphertext, &self.signature)
            .map_err(|_| FsError::BadSignature)
    }

    /// Decrypt with the keyword.
    pub fn decrypt(&self, keyword: &str) -> Result<Vec<u8>> {
        // The keypair check ties the block to the keyword.
        let expected = keyword_keypair(keyword);
        if expected.verifying_key != self.public_key {
            return Err(FsError::BadSignature);
        }
        Ok(content::decode_block_with_key(
            &self.ciphertext,
            &keyword_hash(keyword),
        )?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32 + 64 + self.ciphertext.len());
        w.bytes(&self.public_key.to_bytes())
            .bytes(&self.signature.to_bytes())
            .bytes(&self.ciphertext);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let mut pk = [0u8; 32];
        pk.copy_from_slice(r.take(32)?);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(r.take(64)?);
        let ciphertext = r.rest().to_vec();
        if ciphertext.is_empty() {
            return Err(FsError::Malformed("empty keyword block".to_string()));
        }
        Ok(Self {
            public_key: VerifyingKey::from_bytes(&pk)
                .map_err(|e| FsError::Malformed(e.to_string()))?,
            signature: Signature::from_bytes(&sig),
            ciphertext,
        })
    }
}

// ---------------------------------------------------------------------------
// Namespace signed blocks
// ---------------------------------------------------------------------------

/// A namespace signed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedBlock {
    /// The namespace public key.
    pub namespace: VerifyingKey,
    /// Routing identifier `R = H(namespace) ^ H(identifier)`.
    pub identifier: HashCode,
    /// Content encrypted under `H(identifier)`.
    pub ciphertext: Vec<u8>,
    /// Namespace signature over identifier and ciphertext.
    pub signature: Signature,
}

impl SignedBlock {
    /// Publish `payload` in the namespace under the chosen identifier
    /// string.
    pub fn create(namespace: &KeyPair, identifier: &str, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_BLOCK_SIZE {
            return Err(FsError::BlockTooLarge {
                size: payload.len(),
            });
        }
        let id_hash = HashCode::compute(identifier.as_bytes());
        let routing = routing_id(&namespace.verifying_key, &id_hash);
        let (_, ciphertext) = content::encode_block_with_key(payload, &id_hash, KIND_SIGNED)?;
        let signature = namespace.signing_key.sign(&signed_span(&routing, &ciphertext));
        Ok(Self {
            namespace: namespace.verifying_key.clone(),
            identifier: routing,
            ciphertext,
            signature,
        })
    }

    /// Verify the namespace signature.
    pub fn verify(&self) -> Result<()> {
        self.namespace
            .verify(&signed_span(&self.identifier, &self.ciphertext), &self.signature)
            .map_err(|_| FsError::BadSignature)
    }

    /// Decrypt knowing the identifier string.
    pub fn decrypt(&self, identifier: &str) -> Result<Vec<u8>> {
        let id_hash = HashCode::compute(identifier.as_bytes());
        if routing_id(&self.namespace, &id_hash) != self.identifier {
            return Err(FsError::Malformed("identifier mismatch".to_string()));
        }
        Ok(content::decode_block_with_key(&self.ciphertext, &id_hash)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32 + 64 + 64 + self.ciphertext.len());
        w.bytes(&self.namespace.to_bytes())
            .hash(&self.identifier)
            .bytes(&self.signature.to_bytes())
            .bytes(&self.ciphertext);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let mut ns = [0u8; 32];
        ns.copy_from_slice(r.take(32)?);
        let identifier = r.hash()?;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(r.take(64)?);
        let ciphertext = r.rest().to_vec();
        if ciphertext.is_empty() {
            return Err(FsError::Malformed("empty signed block".to_string()));
        }
        Ok(Self {
            namespace: VerifyingKey::from_bytes(&ns)
                .map_err(|e| FsError::Malformed(e.to_string()))?,
            identifier,
            ciphertext,
            signature: Signature::from_bytes(&sig),
        })
    }
}

/// `R = H(namespace) ^ H(identifier)`.
pub fn routing_id(namespace: &VerifyingKey, id_hash: &HashCode) -> HashCode {
    HashCode::compute(namespace.as_bytes()).distance(id_hash)
}

fn signed_span(identifier: &HashCode, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + ciphertext.len());
    out.extend_from_slice(identifier.as_bytes());
    out.extend_from_slice(ciphertext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_block_roundtrip() {
        let data = b"some file bytes".to_vec();
        let (ck, ciphertext) = encode_data_block(&data).expect("encode");
        assert_eq!(decode_data_block(&ciphertext, &ck.key).expect("decode"), data);
        assert_eq!(data_block_query(&ciphertext), ck.query);
    }

    #[test]
    fn test_data_block_size_limit() {
        assert!(encode_data_block(&vec![0u8; MAX_BLOCK_SIZE]).is_ok());
        assert!(encode_data_block(&vec![0u8; MAX_BLOCK_SIZE + 1]).is_err());
    }

    #[test]
    fn test_inode_roundtrip() {
        let children: Vec<ContentKey> = (0..5u8)
            .map(|i| {
                let (ck, _) = encode_data_block(&[i; 16]).expect("encode child");
                ck
            })
            .collect();
        let block = InodeBlock {
            children: children.clone(),
        };
        let (ck, ciphertext) = block.encode().expect("encode");
        let decoded = InodeBlock::decode(&ciphertext, &ck.key).expect("decode");
        assert_eq!(decoded.children, children);
    }

    #[test]
    fn test_keyword_triple_hash_chain() {
        let q = keyword_query("rust p2p");
        let double = keyword_double_hash("rust p2p");
        assert_eq!(query_from_double_hash(&double), q);
        assert_ne!(keyword_query("other"), q);
    }

    #[test]
    fn test_keyword_block_roundtrip() {
        let kb = KeywordBlock::create("search term", b"file identifier").expect("create");
        kb.verify().expect("verify");
        assert_eq!(kb.decrypt("search term").expect("decrypt"), b"file identifier");
        assert!(kb.decrypt("wrong term").is_err());

        let parsed = KeywordBlock::from_bytes(&kb.to_bytes()).expect("parse");
        assert_eq!(parsed, kb);
    }

    #[test]
    fn test_keyword_block_tamper_detected() {
        let mut kb = KeywordBlock::create("kw", b"payload").expect("create");
        kb.ciphertext[0] ^= 1;
        assert!(kb.verify().is_err());
    }

    #[test]
    fn test_signed_block_roundtrip() {
        let ns = KeyPair::generate();
        let sb = SignedBlock::create(&ns, "article-1", b"namespace content").expect("create");
        sb.verify().expect("verify");
        assert_eq!(
            sb.decrypt("article-1").expect("decrypt"),
            b"namespace content"
        );
        assert!(sb.decrypt("article-2").is_err());

        let parsed = SignedBlock::from_bytes(&sb.to_bytes()).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn test_signed_block_wrong_namespace_rejected() {
        let ns = KeyPair::generate();
        let other = KeyPair::generate();
        let mut sb = SignedBlock::create(&ns, "id", b"content").expect("create");
        sb.namespace = other.verifying_key;
        assert!(sb.verify().is_err());
    }

    #[test]
    fn test_routing_id_symmetry() {
        let ns = KeyPair::generate();
        let id_hash = HashCode::compute(b"id");
        let r = routing_id(&ns.verifying_key, &id_hash);
        // XOR structure: R ^ H(identifier) = H(namespace)
        assert_eq!(
            r.distance(&id_hash),
            HashCode::compute(ns.verifying_key.as_bytes())
        );
    }
}
