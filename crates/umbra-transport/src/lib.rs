//! # umbra-transport
//!
//! The transport abstraction consumed by the connection manager, and two
//! implementations:
//!
//! - [`quic`]: QUIC/TLS 1.3 via `quinn`, the production transport
//! - [`memory`]: an in-process hub wiring nodes together for tests
//!
//! A transport advertises its protocol number, MTU and relative cost; the
//! connection manager prefers lower cost when a peer offers several. Links
//! are reference counted: a caller keeps a session's link alive by holding
//! a clone of its [`TransportLink`] handle.

pub mod memory;
pub mod quic;

use std::sync::Arc;

use umbra_crypto::identity::KeyPair;
use umbra_proto::hello::Hello;

/// Protocol number of the in-memory test transport.
pub const PROTO_MEMORY: u16 = 0;

/// Protocol number of the QUIC transport.
pub const PROTO_QUIC: u16 = 1;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The hello's address blob is not valid for this transport.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Connecting to or talking to the peer failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The link has been closed.
    #[error("link closed")]
    LinkClosed,

    /// A frame exceeds what the transport will carry.
    #[error("frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// The server side is not running.
    #[error("server not started")]
    ServerNotStarted,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// An inbound frame handed up to the connection manager.
pub struct Inbound {
    /// The link the frame arrived on.
    pub link: Arc<dyn TransportLink>,
    /// The raw frame bytes.
    pub frame: Vec<u8>,
}

/// Where a transport delivers inbound frames.
pub type InboundSink = std::sync::mpsc::Sender<Inbound>;

/// One live point-to-point link.
///
/// Cloning the `Arc` keeps the link alive (association); dropping the last
/// clone lets the transport tear it down.
pub trait TransportLink: Send + Sync {
    /// Stable identifier, unique per link within the process.
    fn link_id(&self) -> u64;

    /// Protocol number of the owning transport.
    fn protocol(&self) -> u16;

    /// Queue a frame. Best effort; `reliable` requests retransmission where
    /// the transport distinguishes the two.
    fn send(&self, frame: &[u8], reliable: bool) -> Result<()>;

    /// Close the link. Further sends fail with [`TransportError::LinkClosed`].
    fn disconnect(&self);

    /// Human-readable remote endpoint for log output.
    fn describe(&self) -> String;
}

/// A transport plugin.
pub trait Transport: Send + Sync {
    /// Protocol number advertised in hellos.
    fn protocol(&self) -> u16;

    /// Largest frame this transport carries; 0 = unbounded.
    fn mtu(&self) -> u32;

    /// Relative cost; the connection manager prefers lower.
    fn cost(&self) -> u32;

    /// Create a hello advertising this transport's address for `keys`.
    fn create_hello(&self, keys: &KeyPair, expiration: u64) -> Result<Hello>;

    /// Check transport-specific well-formedness of a hello's address blob.
    /// Signature and expiry are the caller's concern.
    fn verify_hello(&self, hello: &Hello) -> Result<()>;

    /// Open a link to the peer a hello advertises.
    fn connect(&self, hello: &Hello) -> Result<Arc<dyn TransportLink>>;

    /// Start accepting inbound links, delivering frames to `sink`.
    fn start_server(&self, sink: InboundSink) -> Result<()>;

    /// Stop accepting inbound links.
    fn stop_server(&self);

    /// Render a hello's address for display.
    fn address_to_string(&self, hello: &Hello) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::FrameTooLarge { size: 100_000 };
        assert!(err.to_string().contains("100000"));
        assert_eq!(TransportError::LinkClosed.to_string(), "link closed");
    }
}
