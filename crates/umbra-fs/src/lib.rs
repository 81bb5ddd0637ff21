//! # umbra-fs
//!
//! The content-addressed anonymous file-sharing layer:
//!
//! - [`blocks`]: data, inode, keyword and namespace block types with
//!   deterministic query derivation and CHK encryption
//! - [`policy`]: query admission, content migration policy and the
//!   trust-weighted forwarding-set selection
//! - [`router`]: the reply-path query router with TTL/priority-bounded
//!   forwarding
//!
//! Content is encrypted under the hash of its own plaintext, so the
//! network stores and routes blocks it cannot read; queries carry a
//! decaying TTL and a priority that routers cap to the sender's earned
//! trust; replies flow only along the path the query took.

pub mod blocks;
pub mod policy;
pub mod router;

pub use router::{FsRouter, LocalSink, ReplyEvent};

/// Error types for the file-sharing layer.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// A block exceeds the block-size ceiling.
    #[error("block too large: {size} bytes")]
    BlockTooLarge { size: usize },

    /// A block or message failed structural validation.
    #[error("malformed: {0}")]
    Malformed(String),

    /// A keyword or namespace signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] umbra_crypto::CryptoError),

    /// Wire error.
    #[error("protocol error: {0}")]
    Proto(#[from] umbra_proto::ProtoError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] umbra_store::StoreError),
}

/// Convenience result type for the file-sharing layer.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FsError::BlockTooLarge { size: 40000 };
        assert!(err.to_string().contains("40000"));
    }
}
