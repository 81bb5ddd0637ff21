//! In-memory datastore backend.
//!
//! Backs the per-table DHT datastores and tests. Entries live in a map from
//! key to rows; eviction scans for the lowest-priority row, breaking ties by
//! nearest expiration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use umbra_crypto::HashCode;

use crate::{
    Datastore, Entry, EntryVisitor, IterControl, PutOutcome, Result, StoreError, MAX_VALUE_SIZE,
};

struct Inner {
    rows: HashMap<HashCode, Vec<Entry>>,
    count: usize,
}

/// A bounded in-memory datastore.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` rows.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rows: HashMap::new(),
                count: 0,
            }),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert_with_eviction(&self, inner: &mut Inner, entry: Entry) -> Result<PutOutcome> {
        if entry.payload.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: entry.payload.len(),
            });
        }
        if inner.count >= self.max_entries {
            prune_expired(inner, now_secs());
        }
        if inner.count >= self.max_entries {
            // Evict the lowest-priority row, ties broken by nearest
            // expiration, unless the newcomer does not beat it.
            let victim = inner
                .rows
                .iter()
                .flat_map(|(k, v)| v.iter().map(move |e| (*k, e)))
                .min_by_key(|(_, e)| (e.priority, expiry_rank(e.expiration)))
                .map(|(k, e)| (k, e.kind, e.payload.clone(), e.priority));
            match victim {
                Some((_, _, _, lowest)) if entry.priority <= lowest => {
                    return Err(StoreError::Full);
                }
                Some((key, kind, payload, _)) => {
                    remove_row(inner, &key, kind, &payload);
                }
                None => return Err(StoreError::Full),
            }
        }
        inner.rows.entry(entry.key).or_default().push(entry);
        inner.count += 1;
        Ok(PutOutcome::Inserted)
    }
}

impl Datastore for MemoryStore {
    fn put(&self, entry: Entry) -> Result<PutOutcome> {
        let mut inner = self.lock();
        if let Some(rows) = inner.rows.get(&entry.key) {
            if rows
                .iter()
                .any(|e| e.kind == entry.kind && e.payload == entry.payload)
            {
                return Ok(PutOutcome::Duplicate);
            }
        }
        self.insert_with_eviction(&mut inner, entry)
    }

    fn put_update(&self, entry: Entry) -> Result<PutOutcome> {
        let mut inner = self.lock();
        if let Some(rows) = inner.rows.get_mut(&entry.key) {
            if let Some(existing) = rows
                .iter_mut()
                .find(|e| e.kind == entry.kind && e.payload == entry.payload)
            {
                existing.priority = existing.priority.saturating_add(entry.priority);
                existing.expiration = existing.expiration.max(entry.expiration);
                return Ok(PutOutcome::Updated);
            }
        }
        self.insert_with_eviction(&mut inner, entry)
    }

    fn get(
        &self,
        key: &HashCode,
        kind: Option<u16>,
        visitor: EntryVisitor<'_>,
    ) -> Result<usize> {
        let inner = self.lock();
        let now = now_secs();
        let mut visited = 0;
        if let Some(rows) = inner.rows.get(key) {
            for e in rows {
                if expired(e, now) || kind.is_some_and(|k| k != e.kind) {
                    continue;
                }
                visited += 1;
                if visitor(e) == IterControl::Abort {
                    break;
                }
            }
        }
        Ok(visited)
    }

    fn get_random(
        &self,
        near: &HashCode,
        size_limit: usize,
        kind: Option<u16>,
    ) -> Result<Option<Entry>> {
        let inner = self.lock();
        let now = now_secs();
        let candidates: Vec<&Entry> = inner
            .rows
            .values()
            .flatten()
            .filter(|e| {
                !expired(e, now)
                    && e.payload.len() <= size_limit
                    && kind.map_or(true, |k| k == e.kind)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        // Sample a handful and keep the one nearest the hint key.
        let mut rng = rand::thread_rng();
        let picked = (0..4.min(candidates.len()))
            .map(|_| candidates[rng.gen_range(0..candidates.len())])
            .min_by(|a, b| HashCode::distance_cmp(&a.key, &b.key, near));
        Ok(picked.cloned())
    }

    fn del(&self, key: &HashCode, value: Option<&[u8]>) -> Result<usize> {
        let mut inner = self.lock();
        let Some(rows) = inner.rows.get_mut(key) else {
            return Ok(0);
        };
        let before = rows.len();
        match value {
            Some(v) => rows.retain(|e| e.payload != v),
            None => rows.clear(),
        }
        let removed = before - rows.len();
        if rows.is_empty() {
            inner.rows.remove(key);
        }
        inner.count -= removed;
        Ok(removed)
    }

    fn iterate(&self, visitor: EntryVisitor<'_>) -> Result<usize> {
        let inner = self.lock();
        let mut all: Vec<&Entry> = inner.rows.values().flatten().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut visited = 0;
        for e in all {
            visited += 1;
            if visitor(e) == IterControl::Abort {
                break;
            }
        }
        Ok(visited)
    }

    fn len(&self) -> usize {
        self.lock().count
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn expired(e: &Entry, now: u64) -> bool {
    e.expiration != 0 && e.expiration <= now
}

/// Expiration rank for eviction tie-breaks; 0 (never) sorts last.
fn expiry_rank(expiration: u64) -> u64 {
    if expiration == 0 {
        u64::MAX
    } else {
        expiration
    }
}

fn prune_expired(inner: &mut Inner, now: u64) {
    let mut removed = 0;
    inner.rows.retain(|_, rows| {
        let before = rows.len();
        rows.retain(|e| !expired(e, now));
        removed += before - rows.len();
        !rows.is_empty()
    });
    inner.count -= removed;
}

fn remove_row(inner: &mut Inner, key: &HashCode, kind: u16, payload: &[u8]) {
    if let Some(rows) = inner.rows.get_mut(key) {
        if let Some(pos) = rows
            .iter()
            .position(|e| e.kind == kind && e.payload == payload)
        {
            rows.remove(pos);
            inner.count -= 1;
            if rows.is_empty() {
                inner.rows.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: &[u8], priority: u32) -> Entry {
        Entry {
            key: HashCode::compute(tag),
            kind: 1,
            priority,
            anonymity: 0,
            expiration: 0,
            payload: tag.to_vec(),
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemoryStore::new(16);
        let e = entry(b"one", 5);
        assert_eq!(store.put(e.clone()).expect("put"), PutOutcome::Inserted);

        let mut seen = Vec::new();
        store
            .get(&e.key, None, &mut |found| {
                seen.push(found.clone());
                IterControl::Continue
            })
            .expect("get");
        assert_eq!(seen, vec![e]);
    }

    #[test]
    fn test_duplicate_detected() {
        let store = MemoryStore::new(16);
        let e = entry(b"one", 5);
        store.put(e.clone()).expect("put");
        assert_eq!(store.put(e).expect("put"), PutOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_kind_filter() {
        let store = MemoryStore::new(16);
        let a = entry(b"one", 5);
        let mut b = a.clone();
        b.kind = 2;
        b.payload = b"other".to_vec();
        store.put(a.clone()).expect("put");
        store.put(b).expect("put");

        let mut count = 0;
        store
            .get(&a.key, Some(1), &mut |_| {
                count += 1;
                IterControl::Continue
            })
            .expect("get");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_eviction_prefers_lowest_priority() {
        let store = MemoryStore::new(2);
        store.put(entry(b"low", 1)).expect("put");
        store.put(entry(b"high", 9)).expect("put");
        store.put(entry(b"mid", 5)).expect("put evicts low");

        assert_eq!(store.len(), 2);
        let low_key = HashCode::compute(b"low");
        let mut found = 0;
        store
            .get(&low_key, None, &mut |_| {
                found += 1;
                IterControl::Continue
            })
            .expect("get");
        assert_eq!(found, 0, "lowest-priority entry not evicted");
    }

    #[test]
    fn test_put_full_rejects_weak_newcomer() {
        let store = MemoryStore::new(2);
        store.put(entry(b"a", 5)).expect("put");
        store.put(entry(b"b", 6)).expect("put");
        // priority equal to the lowest retained: rejected, no eviction
        let result = store.put(entry(b"c", 5));
        assert!(matches!(result, Err(StoreError::Full)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_eviction_tie_breaks_on_expiration() {
        let store = MemoryStore::new(2);
        let mut soon = entry(b"soon", 3);
        soon.expiration = now_secs() + 100;
        let mut late = entry(b"late", 3);
        late.expiration = now_secs() + 10_000;
        store.put(soon).expect("put");
        store.put(late).expect("put");
        store.put(entry(b"new", 4)).expect("put evicts soon");

        let mut found = 0;
        store
            .get(&HashCode::compute(b"soon"), None, &mut |_| {
                found += 1;
                IterControl::Continue
            })
            .expect("get");
        assert_eq!(found, 0);
    }

    #[test]
    fn test_del_with_value_is_selective() {
        let store = MemoryStore::new(16);
        let key = HashCode::compute(b"shared");
        for payload in [b"v1".as_slice(), b"v2".as_slice()] {
            store
                .put(Entry {
                    key,
                    kind: 1,
                    priority: 1,
                    anonymity: 0,
                    expiration: 0,
                    payload: payload.to_vec(),
                })
                .expect("put");
        }
        assert_eq!(store.del(&key, Some(b"v1")).expect("del"), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.del(&key, None).expect("del"), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_put_update_merges() {
        let store = MemoryStore::new(16);
        let e = entry(b"merge", 5);
        store.put(e.clone()).expect("put");
        assert_eq!(
            store.put_update(e.clone()).expect("update"),
            PutOutcome::Updated
        );
        let mut priority = 0;
        store
            .get(&e.key, None, &mut |found| {
                priority = found.priority;
                IterControl::Continue
            })
            .expect("get");
        assert_eq!(priority, 10);
    }

    #[test]
    fn test_iterate_priority_descending() {
        let store = MemoryStore::new(16);
        store.put(entry(b"a", 1)).expect("put");
        store.put(entry(b"b", 9)).expect("put");
        store.put(entry(b"c", 5)).expect("put");

        let mut priorities = Vec::new();
        store
            .iterate(&mut |e| {
                priorities.push(e.priority);
                IterControl::Continue
            })
            .expect("iterate");
        assert_eq!(priorities, vec![9, 5, 1]);
    }

    #[test]
    fn test_get_random_respects_size_limit() {
        let store = MemoryStore::new(16);
        store.put(entry(b"small", 1)).expect("put");
        let mut big = entry(b"big", 1);
        big.payload = vec![0u8; 1000];
        store.put(big).expect("put");

        let near = HashCode::compute(b"near");
        let sampled = store.get_random(&near, 10, None).expect("sample");
        assert_eq!(sampled.expect("entry").payload, b"small");
    }

    #[test]
    fn test_oversize_value_rejected() {
        let store = MemoryStore::new(16);
        let mut e = entry(b"big", 1);
        e.payload = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(matches!(
            store.put(e),
            Err(StoreError::ValueTooLarge { .. })
        ));
    }
}
