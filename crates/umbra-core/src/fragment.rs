//! Fragmentation and defragmentation.
//!
//! Lets the overlay carry messages larger than a session's MTU. Messages
//! stay limited to 65535 bytes, which keeps reassembly buffers small, and
//! each peer gets at most one reassembly in flight at a time (bounds the
//! memory a misbehaving sender can pin).
//!
//! ## Outbound
//!
//! The message is encoded once, a random 32-bit id is reserved, the first
//! fragment goes out at the message's own priority and the remaining
//! fragments at EXTREME_PRIORITY: if the first fragment was worth sending,
//! stalling its siblings behind newer traffic would only waste the
//! bandwidth already spent.
//!
//! ## Inbound
//!
//! Fragments land in a 16-bucket table keyed by the first word of the
//! sender digest. Each slot keeps a sorted run of fragments. The join rule:
//! a fragment wholly covered by an existing one is dropped; a fragment that
//! bridges two neighbors with no gap supersedes everything between them;
//! otherwise it is inserted in offset order. When the runs cover
//! `[0, total)` the message is assembled and handed to the normal inbound
//! dispatcher as a loopback from the named sender.
//!
//! A cron job purges slots whose expiration passed (default sweep 60 s,
//! slot timeout 3 min from the last fragment).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use umbra_crypto::PeerId;
use umbra_proto::framing::SubMessage;
use umbra_proto::messages::{Fragment, FRAGMENT_HEADER_LEN, MSG_FRAGMENT};
use umbra_proto::MAX_MESSAGE_SIZE;

use crate::connection::ConnectionManager;
use crate::policy::EXTREME_PRIORITY;
use crate::stats::{StatHandle, Stats};
use crate::{CoreError, Result};

/// Number of buckets in the reassembly table.
pub const DEFRAG_BUCKET_COUNT: usize = 16;

/// How long an incomplete reassembly survives after its last fragment.
pub const DEFRAG_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Recommended period for the purge cron job.
pub const DEFRAG_PURGE_PERIOD: Duration = Duration::from_secs(60);

struct Slot {
    sender: PeerId,
    id: u32,
    total: u16,
    /// Received fragments, sorted by offset, non-redundant.
    frags: Vec<Fragment>,
    expires: Instant,
}

/// The fragmentation engine. One per connection manager.
pub struct FragmentationEngine {
    buckets: Vec<Mutex<Vec<Slot>>>,
    id_gen: AtomicU32,
    stat_fragmented: StatHandle,
    stat_defragmented: StatHandle,
    stat_discarded: StatHandle,
}

impl FragmentationEngine {
    pub fn new(stats: &Arc<Stats>) -> Self {
        let mut buckets = Vec::with_capacity(DEFRAG_BUCKET_COUNT);
        for _ in 0..DEFRAG_BUCKET_COUNT {
            buckets.push(Mutex::new(Vec::new()));
        }
        Self {
            buckets,
            id_gen: AtomicU32::new(rand::thread_rng().gen()),
            stat_fragmented: stats.create("# messages fragmented"),
            stat_defragmented: stats.create("# messages defragmented"),
            stat_discarded: stats.create("# fragments discarded"),
        }
    }

    // -- outbound -----------------------------------------------------------

    /// Split an oversize message into fragments and queue them.
    ///
    /// `chunk_budget` is the frame capacity available per fragment
    /// sub-message, including its own headers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Proto`] if the encoded message exceeds the
    /// overlay ceiling; nothing is sent in that case.
    pub fn fragment_outbound(
        &self,
        cm: &ConnectionManager,
        peer: &PeerId,
        msg: SubMessage,
        priority: u32,
        max_delay: Duration,
        chunk_budget: usize,
    ) -> Result<()> {
        let bytes = msg.encode()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CoreError::Proto(umbra_proto::ProtoError::Oversize {
                size: bytes.len(),
            }));
        }
        // Payload per fragment: budget minus the sub-message and fragment
        // headers.
        let overhead = umbra_proto::framing::HEADER_LEN + FRAGMENT_HEADER_LEN;
        let chunk = chunk_budget.saturating_sub(overhead).max(32);
        let total = bytes.len() as u16;
        let id = self
            .id_gen
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(rand::thread_rng().gen_range(0..512));

        self.change(cm, self.stat_fragmented, 1);
        let mut first = true;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let end = (offset + chunk).min(bytes.len());
            let fragment = Fragment {
                id,
                offset: offset as u16,
                total,
                payload: bytes[offset..end].to_vec(),
            };
            let sub = SubMessage::new(MSG_FRAGMENT, fragment.to_bytes());
            let prio = if first { priority } else { EXTREME_PRIORITY };
            cm.send(peer, sub, prio, max_delay)?;
            first = false;
            offset = end;
        }
        Ok(())
    }

    // -- inbound ------------------------------------------------------------

    /// Process one received fragment; delivers the assembled message via
    /// [`ConnectionManager::loopback`] when complete.
    pub fn process_inbound(&self, cm: &ConnectionManager, sender: &PeerId, payload: &[u8]) {
        let fragment = match Fragment::from_bytes(payload) {
            Ok(f) => f,
            Err(_) => {
                self.change(cm, self.stat_discarded, 1);
                return;
            }
        };
        // Oversize total, zero total, or overflowing end: discard.
        if fragment.total == 0 || fragment.end().is_err() {
            self.change(cm, self.stat_discarded, 1);
            return;
        }
        let end = fragment.end().unwrap_or(0);
        if end > fragment.total {
            self.change(cm, self.stat_discarded, 1);
            return;
        }

        let assembled = {
            let mut bucket = self.lock_bucket(self.bucket_for(sender));
            let now = Instant::now();

            let slot_idx = bucket
                .iter()
                .position(|s| s.sender == *sender && s.id == fragment.id);
            let idx = match slot_idx {
                Some(i) => i,
                None => {
                    // One reassembly per sender: an in-progress slot for a
                    // different id is abandoned.
                    if let Some(old) = bucket.iter().position(|s| s.sender == *sender) {
                        let dropped = bucket[old].frags.len();
                        self.change(cm, self.stat_discarded, dropped as i64);
                        bucket.remove(old);
                    }
                    bucket.push(Slot {
                        sender: *sender,
                        id: fragment.id,
                        total: fragment.total,
                        frags: Vec::new(),
                        expires: now + DEFRAG_TIMEOUT,
                    });
                    bucket.len() - 1
                }
            };

            let slot = &mut bucket[idx];
            if slot.total != fragment.total {
                // Inconsistent total for one id: restart with this fragment.
                let dropped = slot.frags.len();
                self.change(cm, self.stat_discarded, dropped as i64);
                slot.frags.clear();
                slot.total = fragment.total;
            }
            if !join(slot, fragment) {
                self.change(cm, self.stat_discarded, 1);
            }
            slot.expires = now + DEFRAG_TIMEOUT;

            match try_assemble(slot) {
                Some(message) => {
                    bucket.remove(idx);
                    Some(message)
                }
                None => None,
            }
        };

        if let Some(message) = assembled {
            self.change(cm, self.stat_defragmented, 1);
            cm.loopback(sender, &message);
        }
    }

    /// Drop reassembly slots whose expiration has passed. Cron job body.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for bucket in &self.buckets {
            let mut bucket = match bucket.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = bucket.len();
            bucket.retain(|s| s.expires > now);
            purged += before - bucket.len();
        }
        purged
    }

    /// Number of reassemblies in flight.
    pub fn pending(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| match b.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    fn bucket_for(&self, sender: &PeerId) -> usize {
        let bytes = sender.0.as_bytes();
        let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        word as usize % DEFRAG_BUCKET_COUNT
    }

    fn lock_bucket(&self, idx: usize) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        match self.buckets[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn change(&self, cm: &ConnectionManager, handle: StatHandle, delta: i64) {
        cm.stats().change(handle, delta);
    }
}

/// Join a fragment into a slot's sorted run.
///
/// Returns `false` when the fragment was redundant: its whole range is
/// already covered by the union of received fragments. Otherwise the
/// fragment is inserted in offset order and every existing fragment it
/// fully contains is superseded and freed.
fn join(slot: &mut Slot, fragment: Fragment) -> bool {
    let off = fragment.offset as u32;
    let end = match fragment.end() {
        Ok(e) => e as u32,
        Err(_) => return false,
    };

    // Walk the sorted (possibly overlapping) runs; if they cover
    // [off, end) without a gap, the newcomer brings nothing.
    let mut covered = off;
    for f in &slot.frags {
        let f_off = f.offset as u32;
        if f_off > covered {
            break; // gap before our range is filled
        }
        covered = covered.max(f_off + f.payload.len() as u32);
        if covered >= end {
            return false;
        }
    }

    // Supersede fragments wholly inside the newcomer.
    slot.frags.retain(|f| {
        let f_off = f.offset as u32;
        let f_end = f_off + f.payload.len() as u32;
        !(f_off >= off && f_end <= end)
    });
    let pos = slot
        .frags
        .iter()
        .position(|f| f.offset as u32 > off)
        .unwrap_or(slot.frags.len());
    slot.frags.insert(pos, fragment);
    true
}

/// Check whether the sorted runs cover `[0, total)`; assemble if so.
fn try_assemble(slot: &Slot) -> Option<Vec<u8>> {
    if slot.total == 0 {
        return None;
    }
    let mut covered: u32 = 0;
    for f in &slot.frags {
        if f.offset as u32 > covered {
            return None; // hole
        }
        let f_end = f.offset as u32 + f.payload.len() as u32;
        covered = covered.max(f_end);
    }
    if covered < slot.total as u32 {
        return None;
    }
    let mut out = vec![0u8; slot.total as usize];
    for f in &slot.frags {
        let start = f.offset as usize;
        let end = (start + f.payload.len()).min(out.len());
        out[start..end].copy_from_slice(&f.payload[..end - start]);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot {
            sender: PeerId(umbra_crypto::HashCode::compute(b"sender")),
            id: 1,
            total: 100,
            frags: Vec::new(),
            expires: Instant::now() + DEFRAG_TIMEOUT,
        }
    }

    fn frag(offset: u16, payload: &[u8]) -> Fragment {
        Fragment {
            id: 1,
            offset,
            total: 100,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_join_in_order() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 40])));
        assert!(join(&mut s, frag(40, &[2; 40])));
        assert!(join(&mut s, frag(80, &[3; 20])));
        assert_eq!(s.frags.len(), 3);
        assert!(try_assemble(&s).is_some());
    }

    #[test]
    fn test_join_out_of_order() {
        let mut s = slot();
        assert!(join(&mut s, frag(80, &[3; 20])));
        assert!(join(&mut s, frag(0, &[1; 40])));
        assert!(join(&mut s, frag(40, &[2; 40])));
        let msg = try_assemble(&s).expect("complete");
        assert_eq!(&msg[..40], &[1u8; 40][..]);
        assert_eq!(&msg[40..80], &[2u8; 40][..]);
        assert_eq!(&msg[80..], &[3u8; 20][..]);
    }

    #[test]
    fn test_contained_fragment_dropped() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 60])));
        assert!(!join(&mut s, frag(10, &[9; 20])), "contained is redundant");
        assert_eq!(s.frags.len(), 1);
    }

    #[test]
    fn test_bridging_fragment_supersedes() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 20])));
        assert!(join(&mut s, frag(80, &[3; 20])));
        assert!(join(&mut s, frag(30, &[9; 30])));
        // A fragment spanning 20..80 covers the run between the neighbors.
        assert!(join(&mut s, frag(20, &[2; 60])));
        assert_eq!(s.frags.len(), 3, "middle run superseded");
        assert!(try_assemble(&s).is_some());
    }

    #[test]
    fn test_meeting_neighbors_reject_bridge() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 50])));
        assert!(join(&mut s, frag(50, &[2; 50])));
        // No hole between them; an overlapping bridge is redundant.
        assert!(!join(&mut s, frag(25, &[9; 50])));
    }

    #[test]
    fn test_incomplete_has_no_assembly() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 40])));
        assert!(join(&mut s, frag(60, &[3; 40])));
        assert!(try_assemble(&s).is_none(), "hole at 40..60");
    }

    #[test]
    fn test_single_fragment_message_completes() {
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 100])));
        let message = try_assemble(&s).expect("complete");
        assert_eq!(message, vec![1u8; 100]);
    }

    #[test]
    fn test_any_permutation_with_duplicates_assembles_once() {
        // Fragments of a 100-byte message in 20-byte chunks, delivered in
        // every rotation, with each fragment duplicated. Completion must
        // happen exactly when coverage first reaches [0, 100).
        let chunks: Vec<Fragment> = (0..5u16)
            .map(|i| frag(i * 20, &[i as u8 + 1; 20]))
            .collect();
        for rotation in 0..5 {
            let mut s = slot();
            let mut completed = 0;
            for step in 0..10 {
                let f = chunks[(rotation + step / 2) % 5].clone();
                join(&mut s, f);
                if try_assemble(&s).is_some() {
                    completed += 1;
                    break;
                }
            }
            assert_eq!(completed, 1, "rotation {rotation} did not complete");
            let message = try_assemble(&s).expect("assembled");
            for (i, chunk) in message.chunks(20).enumerate() {
                assert_eq!(chunk, &[i as u8 + 1; 20][..]);
            }
        }
    }

    #[test]
    fn test_bridging_span_over_duplicates() {
        // Ends first, then a bridge that covers the entire hole plus some
        // overlap with both neighbors.
        let mut s = slot();
        assert!(join(&mut s, frag(0, &[1; 30])));
        assert!(join(&mut s, frag(70, &[3; 30])));
        assert!(join(&mut s, frag(20, &[2; 60])));
        let message = try_assemble(&s).expect("complete");
        assert_eq!(message.len(), 100);
        assert_eq!(&message[0..20], &[1u8; 20][..]);
        assert_eq!(&message[30..70], &[2u8; 40][..]);
        assert_eq!(&message[80..100], &[3u8; 20][..]);
    }
}
