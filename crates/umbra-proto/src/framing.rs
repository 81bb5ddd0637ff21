//! Sub-message framing.
//!
//! A frame delivered by a transport carries one or more sub-messages
//! concatenated back-to-back, each with a `{size, type}` header:
//!
//! ```text
//! +--------+--------+----------------+--------+--------+-------
//! | size   | type   | payload ...    | size   | type   | ...
//! | u16 BE | u16 BE | size - 4 bytes | u16 BE | u16 BE |
//! +--------+--------+----------------+--------+--------+-------
//! ```
//!
//! `size` counts the header itself. A sub-message with `size < 4` or one
//! that overruns the frame makes the whole remainder undecodable; the
//! decoder stops there and reports what it parsed so far together with the
//! error.

use crate::wire::{Reader, Writer};
use crate::{ProtoError, Result, MAX_MESSAGE_SIZE};

/// Size of the `{size, type}` sub-message header.
pub const HEADER_LEN: usize = 4;

/// One decoded sub-message: its type code and payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubMessage {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl SubMessage {
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Total encoded size including the header.
    pub fn wire_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append this sub-message to a frame under construction.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Oversize`] if the sub-message alone exceeds the
    /// 16-bit size field.
    pub fn encode_into(&self, w: &mut Writer) -> Result<()> {
        let size = self.wire_size();
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtoError::Oversize { size });
        }
        w.u16(size as u16).u16(self.msg_type).bytes(&self.payload);
        Ok(())
    }

    /// Encode a single sub-message as its own buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(self.wire_size());
        self.encode_into(&mut w)?;
        Ok(w.into_bytes())
    }
}

/// Encode a sequence of sub-messages into one frame.
pub fn encode_frame(messages: &[SubMessage]) -> Result<Vec<u8>> {
    let total: usize = messages.iter().map(SubMessage::wire_size).sum();
    let mut w = Writer::with_capacity(total);
    for m in messages {
        m.encode_into(&mut w)?;
    }
    Ok(w.into_bytes())
}

/// Decode a frame into its sub-messages.
///
/// # Errors
///
/// Returns [`ProtoError::Malformed`] on a header that is too small or
/// overruns the frame. Sub-messages decoded before the error are lost to
/// the caller; a frame is either well-formed or dropped whole.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<SubMessage>> {
    let mut out = Vec::new();
    let mut r = Reader::new(frame);
    while r.remaining() > 0 {
        let size = r.u16()? as usize;
        let msg_type = r.u16()?;
        if size < HEADER_LEN {
            return Err(ProtoError::Malformed(format!(
                "sub-message size {size} below header size"
            )));
        }
        let payload = r.take(size - HEADER_LEN)?.to_vec();
        out.push(SubMessage { msg_type, payload });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_roundtrip() {
        let m = SubMessage::new(0x0010, b"payload".to_vec());
        let frame = m.encode().expect("encode");
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded, vec![m]);
    }

    #[test]
    fn test_concatenated_roundtrip() {
        let msgs = vec![
            SubMessage::new(0x0001, b"hello".to_vec()),
            SubMessage::new(0x0002, Vec::new()),
            SubMessage::new(0x0010, vec![0xFF; 300]),
        ];
        let frame = encode_frame(&msgs).expect("encode");
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn test_empty_frame() {
        assert!(decode_frame(&[]).expect("decode").is_empty());
    }

    #[test]
    fn test_undersize_header_rejected() {
        // size = 3 < HEADER_LEN
        let frame = [0x00, 0x03, 0x00, 0x01];
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_overrun_rejected() {
        // size = 10 but only 6 bytes present
        let frame = [0x00, 0x0A, 0x00, 0x01, 0xAA, 0xBB];
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_wire_size_counts_header() {
        let m = SubMessage::new(1, vec![0u8; 10]);
        assert_eq!(m.wire_size(), 14);
    }
}
