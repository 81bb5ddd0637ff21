//! Routing buckets over the XOR-distance space, and k-best sets.
//!
//! Buckets partition the space of XOR distances to our own identity by
//! leading-zero count: bucket `i` of `n` holds peers whose distance has a
//! leading-zero count in `[i * 512/n, (i+1) * 512/n)`. A peer that times
//! out of activity is evicted to make room for a newer peer only after a
//! liveness ping failed.

use std::time::Instant;

use umbra_crypto::hash::HASH_LEN;
use umbra_crypto::{HashCode, PeerId};

use crate::TableId;

/// Default number of buckets over the 512-bit space.
pub const DEFAULT_BUCKET_COUNT: usize = 64;

/// Default ceiling on peers per bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Per-peer routing information.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Last time any message arrived from this peer.
    pub last_activity: Instant,
    /// Last time the peer told us its table memberships.
    pub last_table_refresh: Instant,
    /// Last time we sent this peer a liveness ping.
    pub last_ping_sent: Option<Instant>,
    /// Tables the peer is known to participate in.
    pub tables: Vec<TableId>,
}

impl PeerInfo {
    pub fn new(id: PeerId, tables: Vec<TableId>) -> Self {
        let now = Instant::now();
        Self {
            id,
            last_activity: now,
            last_table_refresh: now,
            last_ping_sent: None,
            tables,
        }
    }

    pub fn participates_in(&self, table: &TableId) -> bool {
        self.tables.contains(table)
    }
}

/// One bucket: peers whose distance falls in `[bstart, bend)` leading
/// zeros.
#[derive(Debug)]
pub struct PeerBucket {
    pub bstart: usize,
    pub bend: usize,
    pub peers: Vec<PeerInfo>,
}

/// Outcome of offering a peer to the table.
#[derive(Debug)]
pub enum AddOutcome {
    /// Newly inserted.
    Inserted,
    /// Already present; activity refreshed.
    Updated,
    /// Our own identity or an unplaceable id; ignored.
    Ignored,
    /// The bucket is full. The caller should ping the returned stale peer
    /// and retry after the ping fails.
    BucketFull {
        /// The least-recently-refreshed peer in the bucket.
        stale: PeerId,
    },
}

/// The routing table: buckets keyed by XOR distance to our identity.
pub struct RoutingBuckets {
    self_id: PeerId,
    buckets: Vec<PeerBucket>,
    bucket_size: usize,
}

impl RoutingBuckets {
    /// Create `bucket_count` buckets partitioning the leading-zero range.
    /// `bucket_count` must divide the identity bit width.
    pub fn new(self_id: PeerId, bucket_count: usize, bucket_size: usize) -> Self {
        let bits = HASH_LEN * 8;
        let count = bucket_count.clamp(1, bits);
        let width = bits / count;
        let buckets = (0..count)
            .map(|i| PeerBucket {
                bstart: i * width,
                bend: if i + 1 == count { bits + 1 } else { (i + 1) * width },
                peers: Vec::new(),
            })
            .collect();
        Self {
            self_id,
            buckets,
            bucket_size,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// The bucket a peer belongs in; `None` for our own identity.
    fn bucket_index(&self, peer: &PeerId) -> Option<usize> {
        let lz = self.self_id.distance(peer).leading_zeros()?;
        self.buckets
            .iter()
            .position(|b| lz >= b.bstart && lz < b.bend)
    }

    /// Offer a peer to the table, merging table memberships on update.
    pub fn offer(&mut self, peer: PeerId, tables: &[TableId]) -> AddOutcome {
        if peer == self.self_id {
            return AddOutcome::Ignored;
        }
        let Some(idx) = self.bucket_index(&peer) else {
            return AddOutcome::Ignored;
        };
        let size = self.bucket_size;
        let bucket = &mut self.buckets[idx];
        if let Some(info) = bucket.peers.iter_mut().find(|p| p.id == peer) {
            let now = Instant::now();
            info.last_activity = now;
            if !tables.is_empty() {
                info.last_table_refresh = now;
                for t in tables {
                    if !info.tables.contains(t) {
                        info.tables.push(*t);
                    }
                }
            }
            return AddOutcome::Updated;
        }
        if bucket.peers.len() < size {
            bucket.peers.push(PeerInfo::new(peer, tables.to_vec()));
            return AddOutcome::Inserted;
        }
        let stale = bucket
            .peers
            .iter()
            .min_by_key(|p| p.last_table_refresh)
            .map(|p| p.id);
        match stale {
            Some(stale) => AddOutcome::BucketFull { stale },
            None => AddOutcome::Ignored,
        }
    }

    /// Replace a stale peer with a newer one after its liveness ping
    /// failed. A no-op if the stale peer already left the bucket.
    pub fn replace(&mut self, stale: &PeerId, newcomer: PeerId, tables: &[TableId]) -> bool {
        let Some(idx) = self.bucket_index(stale) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.peers.iter().position(|p| p.id == *stale) {
            Some(pos) => {
                bucket.peers.remove(pos);
                drop(bucket);
                matches!(self.offer(newcomer, tables), AddOutcome::Inserted)
            }
            None => false,
        }
    }

    /// Remove a peer.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerInfo> {
        let idx = self.bucket_index(peer)?;
        let bucket = &mut self.buckets[idx];
        let pos = bucket.peers.iter().position(|p| p.id == *peer)?;
        Some(bucket.peers.remove(pos))
    }

    /// Look up a peer's routing info.
    pub fn find(&self, peer: &PeerId) -> Option<&PeerInfo> {
        let idx = self.bucket_index(peer)?;
        self.buckets[idx].peers.iter().find(|p| p.id == *peer)
    }

    pub fn find_mut(&mut self, peer: &PeerId) -> Option<&mut PeerInfo> {
        let idx = self.bucket_index(peer)?;
        self.buckets[idx].peers.iter_mut().find(|p| p.id == *peer)
    }

    /// The `k` known participants of `table` closest to `key`.
    pub fn k_best_for_table(
        &self,
        table: &TableId,
        key: &HashCode,
        k: usize,
    ) -> Vec<PeerId> {
        let mut best = KBest::new(*key, k);
        for bucket in &self.buckets {
            for peer in &bucket.peers {
                if peer.participates_in(table) {
                    best.insert(peer.id.0);
                }
            }
        }
        best.members().iter().map(|h| PeerId(*h)).collect()
    }

    /// Every peer currently in a bucket.
    pub fn all_peers(&self) -> Vec<PeerId> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter().map(|p| p.id))
            .collect()
    }

    /// Visit every peer mutably (maintenance sweep).
    pub fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut PeerInfo) -> SweepAction) {
        for bucket in &mut self.buckets {
            bucket.peers.retain_mut(|peer| f(peer) != SweepAction::Evict);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the maintenance sweep decided for one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepAction {
    Keep,
    Evict,
}

/// A bounded set of the digests closest to a reference key.
///
/// Insertion replaces the furthest member when a strictly closer candidate
/// arrives, so the final set is exactly the k closest of everything
/// offered.
pub struct KBest {
    key: HashCode,
    limit: usize,
    members: Vec<HashCode>,
}

impl KBest {
    pub fn new(key: HashCode, limit: usize) -> Self {
        Self {
            key,
            limit: limit.max(1),
            members: Vec::new(),
        }
    }

    /// Offer a candidate; duplicates are ignored.
    pub fn insert(&mut self, candidate: HashCode) {
        if self.members.contains(&candidate) {
            return;
        }
        if self.members.len() < self.limit {
            self.members.push(candidate);
            return;
        }
        // Find the furthest member; replace it if the candidate is
        // strictly closer.
        let furthest = self
            .members
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| HashCode::distance_cmp(a, b, &self.key))
            .map(|(i, _)| i);
        if let Some(i) = furthest {
            if HashCode::distance_cmp(&candidate, &self.members[i], &self.key)
                == std::cmp::Ordering::Less
            {
                self.members[i] = candidate;
            }
        }
    }

    pub fn members(&self) -> &[HashCode] {
        &self.members
    }

    pub fn contains(&self, candidate: &HashCode) -> bool {
        self.members.contains(candidate)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::identity::KeyPair;

    fn pid(tag: u8) -> PeerId {
        PeerId(HashCode::compute(&[tag]))
    }

    #[test]
    fn test_offer_and_find() {
        let me = KeyPair::generate().peer_id();
        let mut rb = RoutingBuckets::new(me, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE);
        let peer = pid(1);
        assert!(matches!(rb.offer(peer, &[]), AddOutcome::Inserted));
        assert!(matches!(rb.offer(peer, &[]), AddOutcome::Updated));
        assert_eq!(rb.len(), 1);
        assert!(rb.find(&peer).is_some());
    }

    #[test]
    fn test_self_ignored() {
        let me = KeyPair::generate().peer_id();
        let mut rb = RoutingBuckets::new(me, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE);
        assert!(matches!(rb.offer(me, &[]), AddOutcome::Ignored));
        assert!(rb.is_empty());
    }

    #[test]
    fn test_table_memberships_merge() {
        let me = KeyPair::generate().peer_id();
        let mut rb = RoutingBuckets::new(me, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE);
        let peer = pid(1);
        let (ta, tb) = (HashCode::compute(b"ta"), HashCode::compute(b"tb"));
        rb.offer(peer, &[ta]);
        rb.offer(peer, &[tb]);
        let info = rb.find(&peer).expect("peer");
        assert!(info.participates_in(&ta));
        assert!(info.participates_in(&tb));
    }

    #[test]
    fn test_bucket_full_reports_stale() {
        let me = PeerId(HashCode::ZERO);
        // One bucket covering everything, capacity 2.
        let mut rb = RoutingBuckets::new(me, 1, 2);
        rb.offer(pid(1), &[]);
        rb.offer(pid(2), &[]);
        match rb.offer(pid(3), &[]) {
            AddOutcome::BucketFull { stale } => {
                assert!(stale == pid(1) || stale == pid(2));
                // Ping failed: replace.
                assert!(rb.replace(&stale, pid(3), &[]));
                assert!(rb.find(&pid(3)).is_some());
                assert!(rb.find(&stale).is_none());
            }
            other => unreachable!("expected BucketFull, got {other:?}"),
        }
    }

    #[test]
    fn test_k_best_for_table() {
        let me = KeyPair::generate().peer_id();
        let mut rb = RoutingBuckets::new(me, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE);
        let t = HashCode::compute(b"table");
        for i in 0..10u8 {
            let tables = if i % 2 == 0 { vec![t] } else { vec![] };
            rb.offer(pid(i), &tables);
        }
        let best = rb.k_best_for_table(&t, &HashCode::compute(b"key"), 3);
        assert_eq!(best.len(), 3);
        for p in &best {
            assert!(rb.find(p).expect("known").participates_in(&t));
        }
    }

    #[test]
    fn test_sweep_eviction() {
        let me = KeyPair::generate().peer_id();
        let mut rb = RoutingBuckets::new(me, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE);
        for i in 0..4u8 {
            rb.offer(pid(i), &[]);
        }
        let victim = pid(0);
        rb.for_each_mut(&mut |peer| {
            if peer.id == victim {
                SweepAction::Evict
            } else {
                SweepAction::Keep
            }
        });
        assert_eq!(rb.len(), 3);
        assert!(rb.find(&victim).is_none());
    }

    #[test]
    fn test_k_best_exactness() {
        // Property: the set equals the k smallest XOR distances among all
        // inserted candidates.
        let key = HashCode::compute(b"target");
        let candidates: Vec<HashCode> =
            (0..50u32).map(|i| HashCode::compute(&i.to_be_bytes())).collect();

        let mut kb = KBest::new(key, 8);
        for c in &candidates {
            kb.insert(*c);
        }

        let mut sorted = candidates.clone();
        sorted.sort_by(|a, b| HashCode::distance_cmp(a, b, &key));
        let expected: Vec<HashCode> = sorted.into_iter().take(8).collect();

        let mut got = kb.members().to_vec();
        got.sort_by(|a, b| HashCode::distance_cmp(a, b, &key));
        assert_eq!(got, expected);
    }

    #[test]
    fn test_k_best_ignores_duplicates() {
        let key = HashCode::ZERO;
        let mut kb = KBest::new(key, 4);
        let c = HashCode::compute(b"x");
        kb.insert(c);
        kb.insert(c);
        assert_eq!(kb.len(), 1);
    }
}
