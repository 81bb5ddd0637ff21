//! # umbra-store
//!
//! Content storage for an Umbra node.
//!
//! This crate provides:
//! - The [`Datastore`] trait: put / get-by-key-and-type / remove / iterate
//!   with priority-based eviction, shared by the file-sharing layer and the
//!   per-table DHT datastores
//! - An in-memory backend ([`memory::MemoryStore`]) and a SQLite backend
//!   ([`sqlite::SqliteStore`])
//! - Counting bloom filters ([`bloom::BloomFilter`]) answering "might this
//!   content exist locally?" without touching the store
//! - [`ContentStore`]: a datastore paired with the single-block and
//!   super-block filters, keeping both in sync on insert and delete
//!
//! ## Eviction contract
//!
//! `put` on a full store evicts the lowest-priority entry, breaking ties by
//! nearest expiration: unless the newcomer's priority does not exceed the
//! lowest retained priority, in which case `put` fails with
//! [`StoreError::Full`] and nothing is evicted.

pub mod bloom;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use umbra_crypto::HashCode;

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store is full and the candidate's priority does not beat the
    /// lowest retained entry.
    #[error("store full")]
    Full,

    /// The entry payload exceeds the per-entry ceiling.
    #[error("value too large: {size} bytes")]
    ValueTooLarge { size: usize },

    /// No entry matched.
    #[error("not found")]
    NotFound,

    /// SQLite error.
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Convenience result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Ceiling on a single stored payload. Matches the largest content block
/// plus encryption overhead.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

/// One stored entry.
///
/// Keys are not unique: several entries may share a key, across types or
/// even within one. `anonymity` governs whether the entry may be returned
/// on direct (non-anonymized) requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: HashCode,
    /// Type tag; the store does not interpret it beyond filtering.
    pub kind: u16,
    /// Governs eviction: lowest goes first.
    pub priority: u32,
    /// Minimum anonymity level required to serve this entry.
    pub anonymity: u32,
    /// Expiration, seconds since the Unix epoch. 0 = never.
    pub expiration: u64,
    pub payload: Vec<u8>,
}

/// Outcome of a successful put.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new row was stored.
    Inserted,
    /// A byte-identical row already existed; nothing was stored.
    Duplicate,
    /// An existing row was merged (priority added, expiration extended).
    Updated,
}

/// Flow control for iteration callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    Abort,
}

/// Visitor invoked per matching entry; order is undefined.
pub type EntryVisitor<'a> = &'a mut dyn FnMut(&Entry) -> IterControl;

/// The pluggable datastore capability.
pub trait Datastore: Send + Sync {
    /// Store an entry. A byte-identical row (same key, kind, payload) is
    /// reported as [`PutOutcome::Duplicate`] and not stored twice.
    fn put(&self, entry: Entry) -> Result<PutOutcome>;

    /// Store or merge: an existing row with the same key, kind and payload
    /// has the priorities added and the later expiration kept.
    fn put_update(&self, entry: Entry) -> Result<PutOutcome>;

    /// Visit entries under `key`, optionally filtered by kind. Returns the
    /// number of entries visited.
    fn get(&self, key: &HashCode, kind: Option<u16>, visitor: EntryVisitor<'_>)
        -> Result<usize>;

    /// Sample an entry near `near` for migration, at most `size_limit`
    /// payload bytes, optionally filtered by kind.
    fn get_random(
        &self,
        near: &HashCode,
        size_limit: usize,
        kind: Option<u16>,
    ) -> Result<Option<Entry>>;

    /// Remove entries under `key`. With a value, only byte-equal rows are
    /// removed; without, every row under the key. Returns the number
    /// removed.
    fn del(&self, key: &HashCode, value: Option<&[u8]>) -> Result<usize>;

    /// Visit every entry, highest priority first. Returns the number
    /// visited.
    fn iterate(&self, visitor: EntryVisitor<'_>) -> Result<usize>;

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A datastore paired with the bloom filters that answer fast negative
/// lookups.
///
/// Every insertion that stores a new row sets the single-block filter;
/// every confirmed deletion clears it. False positives from collisions are
/// accepted, false negatives for present keys are not.
pub struct ContentStore {
    store: Arc<dyn Datastore>,
    single: bloom::BloomFilter,
    super_: bloom::BloomFilter,
}

impl ContentStore {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            single: bloom::BloomFilter::new(bloom::DEFAULT_BITS),
            super_: bloom::BloomFilter::new(bloom::DEFAULT_BITS),
        }
    }

    /// The underlying datastore.
    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    /// Bloom-filter probe: may this key exist locally?
    pub fn fast_get(&self, key: &HashCode) -> bool {
        self.single.test(key)
    }

    /// Probe the super-block filter.
    pub fn fast_get_super(&self, key: &HashCode) -> bool {
        self.super_.test(key)
    }

    /// Put an entry, updating the single-block filter on a fresh insert.
    pub fn put(&self, entry: Entry) -> Result<PutOutcome> {
        let key = entry.key;
        let outcome = self.store.put(entry)?;
        if outcome == PutOutcome::Inserted {
            self.single.add(&key);
        }
        Ok(outcome)
    }

    /// Merge-put, updating the filter on a fresh insert.
    pub fn put_update(&self, entry: Entry) -> Result<PutOutcome> {
        let key = entry.key;
        let outcome = self.store.put_update(entry)?;
        if outcome == PutOutcome::Inserted {
            self.single.add(&key);
        }
        Ok(outcome)
    }

    /// Visit entries under a key.
    pub fn get(
        &self,
        key: &HashCode,
        kind: Option<u16>,
        visitor: EntryVisitor<'_>,
    ) -> Result<usize> {
        self.store.get(key, kind, visitor)
    }

    /// Delete entries; clears the filter once per removal so collisions keep
    /// their remaining count.
    pub fn del(&self, key: &HashCode, value: Option<&[u8]>) -> Result<usize> {
        let removed = self.store.del(key, value)?;
        for _ in 0..removed {
            self.single.remove(key);
        }
        Ok(removed)
    }

    /// Mark a super-query digest as locally answerable.
    pub fn index_super(&self, key: &HashCode) {
        self.super_.add(key);
    }

    /// Unmark a super-query digest.
    pub fn unindex_super(&self, key: &HashCode) {
        self.super_.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn entry(key: &HashCode, payload: &[u8]) -> Entry {
        Entry {
            key: *key,
            kind: 1,
            priority: 5,
            anonymity: 0,
            expiration: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_content_store_filter_tracking() {
        let cs = ContentStore::new(Arc::new(MemoryStore::new(16)));
        let key = HashCode::compute(b"k");
        assert!(!cs.fast_get(&key));

        cs.put(entry(&key, b"v")).expect("put");
        assert!(cs.fast_get(&key));

        // duplicate insert does not double-count the filter
        cs.put(entry(&key, b"v")).expect("put dupe");

        cs.del(&key, None).expect("del");
        assert!(!cs.fast_get(&key));
    }

    #[test]
    fn test_super_filter_independent() {
        let cs = ContentStore::new(Arc::new(MemoryStore::new(16)));
        let key = HashCode::compute(b"super");
        cs.index_super(&key);
        assert!(cs.fast_get_super(&key));
        assert!(!cs.fast_get(&key));
        cs.unindex_super(&key);
        assert!(!cs.fast_get_super(&key));
    }
}
