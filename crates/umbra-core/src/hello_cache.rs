//! Cache of verified hello records.
//!
//! Exactly one current hello is retained per (identity, transport) pair; a
//! newer record (later expiration) replaces the cached one. Writers publish
//! a fresh immutable `Arc`; readers take snapshot pointers and never block
//! writers for long.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use umbra_crypto::PeerId;
use umbra_proto::hello::Hello;

/// The hello cache.
#[derive(Default)]
pub struct HelloCache {
    records: RwLock<HashMap<(PeerId, u16), Arc<Hello>>>,
}

impl HelloCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a verified hello. Returns `false` if a same-or-newer record
    /// for the (identity, transport) pair was already cached.
    pub fn insert(&self, hello: Hello) -> bool {
        let key = (hello.subject, hello.protocol);
        let mut records = self.write();
        match records.get(&key) {
            Some(existing) if existing.expiration >= hello.expiration => false,
            _ => {
                records.insert(key, Arc::new(hello));
                true
            }
        }
    }

    /// Snapshot of the current hello for a peer on a specific transport.
    pub fn get(&self, peer: &PeerId, protocol: u16) -> Option<Arc<Hello>> {
        self.read().get(&(*peer, protocol)).cloned()
    }

    /// All current hellos for a peer, across transports.
    pub fn get_any(&self, peer: &PeerId) -> Vec<Arc<Hello>> {
        self.read()
            .iter()
            .filter(|((id, _), _)| id == peer)
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    /// Drop records whose expiration has passed.
    pub fn purge_expired(&self, now_secs: u64) -> usize {
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, h| h.expiration > now_secs);
        before - records.len()
    }

    /// Identities with at least one cached hello.
    pub fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.read().keys().map(|(id, _)| *id).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(PeerId, u16), Arc<Hello>>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(PeerId, u16), Arc<Hello>>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::identity::KeyPair;

    fn hello(keys: &KeyPair, protocol: u16, expiration: u64) -> Hello {
        Hello::create(keys, protocol, 1400, expiration, b"addr".to_vec()).expect("hello")
    }

    #[test]
    fn test_insert_and_get() {
        let cache = HelloCache::new();
        let keys = KeyPair::generate();
        assert!(cache.insert(hello(&keys, 1, 100)));
        assert!(cache.get(&keys.peer_id(), 1).is_some());
        assert!(cache.get(&keys.peer_id(), 2).is_none());
    }

    #[test]
    fn test_newer_replaces_older() {
        let cache = HelloCache::new();
        let keys = KeyPair::generate();
        assert!(cache.insert(hello(&keys, 1, 100)));
        assert!(!cache.insert(hello(&keys, 1, 100)), "same expiry rejected");
        assert!(!cache.insert(hello(&keys, 1, 50)), "older rejected");
        assert!(cache.insert(hello(&keys, 1, 200)));
        let cached = cache.get(&keys.peer_id(), 1).expect("cached");
        assert_eq!(cached.expiration, 200);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_one_per_transport() {
        let cache = HelloCache::new();
        let keys = KeyPair::generate();
        cache.insert(hello(&keys, 1, 100));
        cache.insert(hello(&keys, 2, 100));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_any(&keys.peer_id()).len(), 2);
        assert_eq!(cache.known_peers(), vec![keys.peer_id()]);
    }

    #[test]
    fn test_purge_expired() {
        let cache = HelloCache::new();
        let keys = KeyPair::generate();
        cache.insert(hello(&keys, 1, 100));
        assert_eq!(cache.purge_expired(99), 0);
        assert_eq!(cache.purge_expired(100), 1);
        assert!(cache.is_empty());
    }
}
