//! # umbra-proto
//!
//! Every byte layout that crosses the Umbra overlay:
//!
//! - **Hello records**: signed peer-address advertisements via [`hello`]
//! - **Sub-message framing**: `{size, type}` headers concatenated
//!   back-to-back inside one frame via [`framing`]
//! - **Typed messages**: queries, replies, fragments, ping/pong via
//!   [`messages`]
//!
//! All multi-byte integers are network byte order. Decoders validate sizes
//! before reading and reject anything malformed; per the overlay error
//! policy no parse error is ever reported back to the sender.

pub mod framing;
pub mod hello;
pub mod messages;
pub mod wire;

/// Hard ceiling on any overlay message, fragmented or not. Bounds the
/// reassembly buffers of the fragmentation layer.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Error types for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The buffer ended before the structure was complete.
    #[error("truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// A size or count field is inconsistent with the buffer.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A message exceeds [`MAX_MESSAGE_SIZE`].
    #[error("oversize message: {size} bytes")]
    Oversize { size: usize },

    /// The signature on a signed structure did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Cryptographic error from umbra-crypto.
    #[error("crypto error: {0}")]
    Crypto(#[from] umbra_crypto::CryptoError),
}

/// Convenience result type for wire operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
