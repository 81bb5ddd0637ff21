//! Big-endian read/write helpers shared by all wire structures.

use umbra_crypto::hash::HASH_LEN;
use umbra_crypto::{HashCode, PeerId};

use crate::{ProtoError, Result};

/// Sequential reader over a received byte buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtoError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn hash(&mut self) -> Result<HashCode> {
        let b = self.take(HASH_LEN)?;
        Ok(HashCode::from_slice(b)?)
    }

    pub fn peer_id(&mut self) -> Result<PeerId> {
        Ok(PeerId(self.hash()?))
    }

    /// Everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Fail unless the buffer was consumed exactly.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtoError::Malformed(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Sequential writer producing a wire buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn hash(&mut self, v: &HashCode) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    pub fn peer_id(&mut self, v: &PeerId) -> &mut Self {
        self.hash(&v.0)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_integers() {
        let mut w = Writer::new();
        w.u16(0xBEEF).u32(0xDEAD_BEEF).u64(42).i32(-7);
        let buf = w.into_bytes();

        let mut r = Reader::new(&buf);
        assert_eq!(r.u16().expect("u16"), 0xBEEF);
        assert_eq!(r.u32().expect("u32"), 0xDEAD_BEEF);
        assert_eq!(r.u64().expect("u64"), 42);
        assert_eq!(r.i32().expect("i32"), -7);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_truncation_detected() {
        let mut r = Reader::new(&[0x01]);
        assert!(matches!(r.u32(), Err(ProtoError::Truncated { .. })));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let r = Reader::new(&[0x01, 0x02]);
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_hash_roundtrip() {
        let h = HashCode::compute(b"x");
        let mut w = Writer::new();
        w.hash(&h);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(r.hash().expect("hash"), h);
    }

    #[test]
    fn test_network_byte_order() {
        let mut w = Writer::new();
        w.u16(0x0102);
        assert_eq!(w.into_bytes(), vec![0x01, 0x02]);
    }
}
