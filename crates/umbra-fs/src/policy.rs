//! Query and content policy for the anonymous router.
//!
//! Decides, per inbound query, whether this node answers, forwards and
//! indirects (substitutes itself as the reply target), and what priority it
//! will honor; and per routed reply, whether the content is worth caching
//! for migration.

use rand::Rng;
use umbra_core::ConnectionManager;
use umbra_crypto::PeerId;

/// Seconds of lifetime one TTL unit is worth; every hop decrements the TTL
/// by twice this plus a random fraction of it.
pub const TTL_DECREMENT: i32 = 5;

/// Preference floor granted to any sender whose query is not dropped.
pub const QUERY_BANDWIDTH_VALUE: f64 = 0.001;

/// Preference floor granted for routed content.
pub const CONTENT_BANDWIDTH_VALUE: f64 = 0.02;

/// Ceiling on the priority a single query may claim from us.
pub const MAX_QUERY_PRIORITY: u32 = 0x1F;

/// What we are willing to do with one query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Answer from the local store.
    pub answer: bool,
    /// Forward to other peers.
    pub forward: bool,
    /// Substitute ourselves as the reply target when forwarding.
    pub indirect: bool,
    /// Highest priority we honor for this sender.
    pub priority_cap: u32,
}

/// Evaluate a query from `sender` claiming `priority`.
///
/// Returns `None` for a straight drop. The cap combines the claimed
/// priority, the sender's earned trust and a hard ceiling; load sheds the
/// expensive behaviors first: indirection goes above 50% load, forwarding
/// above 75%, and everything above 100%.
pub fn evaluate_query(
    cm: &ConnectionManager,
    sender: &PeerId,
    priority: u32,
) -> Option<QueryPolicy> {
    let load = cm.load_percent();
    if load > 100 {
        return None;
    }
    let trust = cm.get_trust(sender);
    let priority_cap = priority.min(trust.max(1)).min(MAX_QUERY_PRIORITY);
    Some(QueryPolicy {
        answer: true,
        forward: load <= 75,
        indirect: load <= 50,
        priority_cap,
    })
}

/// Evaluate routed content for caching/migration.
///
/// Returns the storage priority, or `None` when the content is not worth
/// replicating here (the reply is still forwarded either way).
pub fn evaluate_content(cm: &ConnectionManager, reply_priority: u32) -> Option<u32> {
    if cm.load_percent() > 100 {
        return None;
    }
    if reply_priority == 0 {
        return None;
    }
    Some(reply_priority)
}

/// Pick a forwarding set: up to `count` connected peers excluding
/// `exclude`, randomly weighted by trust and recent preference.
pub fn select_forwarding_set(
    cm: &ConnectionManager,
    exclude: &[PeerId],
    count: usize,
) -> Vec<PeerId> {
    let mut candidates: Vec<(PeerId, f64)> = cm
        .connected_peers()
        .into_iter()
        .filter(|p| !exclude.contains(p))
        .map(|p| {
            let weight = 1.0 + f64::from(cm.get_trust(&p)) + cm.preference(&p);
            (p, weight)
        })
        .collect();

    let mut rng = rand::thread_rng();
    let mut picked = Vec::with_capacity(count);
    while picked.len() < count && !candidates.is_empty() {
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        let mut roll = rng.gen_range(0.0..total.max(f64::MIN_POSITIVE));
        let mut chosen = 0;
        for (i, (_, w)) in candidates.iter().enumerate() {
            if roll < *w {
                chosen = i;
                break;
            }
            roll -= w;
        }
        picked.push(candidates.remove(chosen).0);
    }
    picked
}

/// How many peers a query of the given effective priority fans out to.
pub fn forward_fanout(priority: u32) -> usize {
    (2 + (priority / 8) as usize).min(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_bounds() {
        assert_eq!(forward_fanout(0), 2);
        assert_eq!(forward_fanout(16), 4);
        assert_eq!(forward_fanout(1000), 6);
    }
}
