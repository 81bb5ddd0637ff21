//! Named statistics counters.
//!
//! Every drop, discard and noteworthy event in the core increments a named
//! counter. Counters are created once at startup, addressed by handle on
//! the hot path, and dumped as a snapshot over the control protocol.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// Handle to one named counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatHandle(usize);

/// The counter registry.
#[derive(Default)]
pub struct Stats {
    counters: RwLock<Vec<(String, AtomicI64)>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or find) the counter with the given name.
    pub fn create(&self, name: &str) -> StatHandle {
        {
            let counters = self.read();
            if let Some(idx) = counters.iter().position(|(n, _)| n == name) {
                return StatHandle(idx);
            }
        }
        let mut counters = self.write();
        if let Some(idx) = counters.iter().position(|(n, _)| n == name) {
            return StatHandle(idx);
        }
        counters.push((name.to_string(), AtomicI64::new(0)));
        StatHandle(counters.len() - 1)
    }

    /// Adjust a counter.
    pub fn change(&self, handle: StatHandle, delta: i64) {
        let counters = self.read();
        if let Some((_, value)) = counters.get(handle.0) {
            value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Current value of a counter.
    pub fn get(&self, handle: StatHandle) -> i64 {
        let counters = self.read();
        counters
            .get(handle.0)
            .map(|(_, v)| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value by name; 0 if the counter does not exist.
    pub fn get_by_name(&self, name: &str) -> i64 {
        let counters = self.read();
        counters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of every counter, in creation order.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let counters = self.read();
        counters
            .iter()
            .map(|(n, v)| (n.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(String, AtomicI64)>> {
        match self.counters.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(String, AtomicI64)>> {
        match self.counters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_change() {
        let stats = Stats::new();
        let h = stats.create("# test events");
        stats.change(h, 3);
        stats.change(h, -1);
        assert_eq!(stats.get(h), 2);
        assert_eq!(stats.get_by_name("# test events"), 2);
    }

    #[test]
    fn test_create_is_idempotent() {
        let stats = Stats::new();
        let a = stats.create("# same");
        let b = stats.create("# same");
        assert_eq!(a, b);
        stats.change(a, 1);
        assert_eq!(stats.get(b), 1);
    }

    #[test]
    fn test_snapshot_order() {
        let stats = Stats::new();
        stats.create("# first");
        stats.create("# second");
        let snap = stats.snapshot();
        assert_eq!(snap[0].0, "# first");
        assert_eq!(snap[1].0, "# second");
    }

    #[test]
    fn test_unknown_name() {
        let stats = Stats::new();
        assert_eq!(stats.get_by_name("# missing"), 0);
    }
}
