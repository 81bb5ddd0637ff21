//! # umbra-dht
//!
//! A Kademlia-style distributed hash table with pluggable per-table
//! datastores, reachable over the RPC substrate.
//!
//! This crate implements:
//! - XOR-distance routing buckets with aging and ping-before-replace via
//!   [`buckets`]
//! - The asynchronous get/put/remove operation engine with
//!   absolute-deadline abort jobs via [`engine`]
//! - Multi-table membership: any digest names a table; the well-known
//!   all-zero **master table** maps table ids to the identities of peers
//!   participating in them
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Replication ceiling (ALPHA) | 7 |
//! | Maintenance period | 15 s |
//! | Peer inactivity death | 56 maintenance periods |
//! | Bucket count | 64 over the 512-bit space |
//! | Bucket target size | 8 |

pub mod buckets;
pub mod engine;

pub use engine::{DhtConfig, DhtEngine, LocalTable};

use umbra_crypto::HashCode;

/// A DHT table identifier. Any digest names a table.
pub type TableId = HashCode;

/// The well-known master table: its values are peer identities
/// participating in other tables.
pub const MASTER_TABLE_ID: TableId = HashCode::ZERO;

/// Mask of the replication/result-count field in operation flags.
pub const FLAG_REPLICATION_MASK: u32 = 0x7;

/// Table flag: migrate local entries into the table on leave.
pub const FLAG_MIGRATE: u32 = 0x8;

/// Table flag: cache routed values.
pub const FLAG_CACHE: u32 = 0x10;

/// Maximum replication factor; also the replication used for master-table
/// advertisements.
pub const ALPHA: u32 = FLAG_REPLICATION_MASK;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The node has not joined the named table.
    #[error("table not found")]
    TableNotFound,

    /// The operation handle is unknown (completed or aborted).
    #[error("unknown operation")]
    UnknownOperation,

    /// A bucket invariant was violated (e.g. our own identity inside a
    /// bucket). Logged and the operation aborted; never fatal to the
    /// process.
    #[error("routing corruption: {0}")]
    Corruption(String),

    /// RPC failure.
    #[error("rpc error: {0}")]
    Rpc(#[from] umbra_rpc::RpcError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] umbra_store::StoreError),

    /// Scheduler failure.
    #[error("cron error: {0}")]
    Cron(#[from] umbra_cron::CronError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Extract the replication/result-count field from operation flags,
/// clamped to at least 1.
pub fn replication_from_flags(flags: u32) -> u32 {
    (flags & FLAG_REPLICATION_MASK).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_layout() {
        assert_eq!(replication_from_flags(0), 1);
        assert_eq!(replication_from_flags(3), 3);
        assert_eq!(replication_from_flags(7 | FLAG_MIGRATE), 7);
        assert_eq!(FLAG_MIGRATE & FLAG_REPLICATION_MASK, 0);
        assert_eq!(FLAG_CACHE & (FLAG_REPLICATION_MASK | FLAG_MIGRATE), 0);
    }

    #[test]
    fn test_master_table_is_zero() {
        assert_eq!(MASTER_TABLE_ID, HashCode::ZERO);
    }
}
