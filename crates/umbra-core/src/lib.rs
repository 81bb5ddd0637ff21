//! # umbra-core
//!
//! The connection core of an Umbra node:
//!
//! - [`connection`]: the connection manager: sessions, send buffers,
//!   coalescing, handshake, handler dispatch
//! - [`fragment`]: fragmentation/defragmentation above the transport MTU
//! - [`policy`]: the bandwidth admission curve, load metering, per-peer
//!   trust and preference scores
//! - [`hello_cache`]: verified peer-address advertisements
//! - [`stats`]: named statistics counters
//!
//! ## Data flow
//!
//! ```text
//! Transport ──frame──> ConnectionManager ──sub-messages──> handlers
//!      ^                     │    ^                        (fs, dht, rpc)
//!      │                     v    │
//!      └──────────── send buffers / fragmentation
//! ```
//!
//! A transport delivers an inbound frame; the manager decrypts and splits
//! it into typed sub-messages and dispatches each to its registered
//! handler. Outbound messages from any subsystem are queued per session,
//! coalesced up to the MTU, admission-checked against the bandwidth curve
//! and fragmented when oversize. The cron substrate drives queue flushes,
//! idle-session eviction and reassembly garbage collection.

pub mod connection;
pub mod fragment;
pub mod hello_cache;
pub mod policy;
pub mod stats;

pub use connection::{ConnectionManager, CoreConfig, P2pHandler};
pub use policy::EXTREME_PRIORITY;
pub use stats::Stats;

/// Error types for the connection core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No route to the peer: no cached hello, no matching transport, or a
    /// failed connect.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The session table is full of referenced sessions.
    #[error("too many sessions")]
    TooManySessions,

    /// No live session for the peer.
    #[error("not connected")]
    NotConnected,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] umbra_transport::TransportError),

    /// Wire encoding/decoding failure.
    #[error("protocol error: {0}")]
    Proto(#[from] umbra_proto::ProtoError),

    /// Cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] umbra_crypto::CryptoError),

    /// Internal error (thread spawn, invariant breach).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result type for the connection core.
pub type Result<T> = std::result::Result<T, CoreError>;
