//! Outbound bandwidth admission and peer preference accounting.
//!
//! The admission rule is a contract, not a tunable: given a measured load
//! L in percent of the configured budget,
//!
//! - L >= 150: always drop
//! - L > 100: send only administrative traffic (priority >= EXTREME)
//! - L <= 50: always send
//! - otherwise: require `priority >= (L - 50)^3`
//!
//! Between 51% and 100% the cubic threshold climbs from 1 to 125000, so
//! ordinary traffic tapers off smoothly while high-priority replies still
//! get through.

use std::sync::Mutex;
use std::time::Instant;

/// Priority granted to administrative messages; passes admission at any
/// load below the hard cutoff.
pub const EXTREME_PRIORITY: u32 = 0xFFFFFF;

/// Should a message with this priority be sent at the given load?
pub fn admit(load_percent: u32, priority: u32) -> bool {
    if load_percent >= 150 {
        return false;
    }
    if load_percent > 100 {
        return priority >= EXTREME_PRIORITY;
    }
    if load_percent <= 50 {
        return true;
    }
    let delta = (load_percent - 50) as u64;
    u64::from(priority) >= delta * delta * delta
}

/// Exponentially smoothed outbound load estimate against a byte budget.
pub struct LoadMeter {
    /// Bytes per second the node is willing to spend.
    budget: u64,
    state: Mutex<LoadState>,
}

struct LoadState {
    /// Smoothed bytes/second.
    rate: f64,
    last: Instant,
}

impl LoadMeter {
    /// Smoothing half-life in seconds.
    const HALF_LIFE_SECS: f64 = 4.0;

    pub fn new(budget_bytes_per_sec: u64) -> Self {
        Self {
            budget: budget_bytes_per_sec.max(1),
            state: Mutex::new(LoadState {
                rate: 0.0,
                last: Instant::now(),
            }),
        }
    }

    /// Record an outbound transmission.
    pub fn record(&self, bytes: usize) {
        let mut state = self.lock();
        decay(&mut state);
        state.rate += bytes as f64 / Self::HALF_LIFE_SECS;
    }

    /// Current load in percent of the budget, capped at 150.
    pub fn load_percent(&self) -> u32 {
        let mut state = self.lock();
        decay(&mut state);
        let pct = state.rate * 100.0 / self.budget as f64;
        (pct.min(150.0)).max(0.0) as u32
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoadState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn decay(state: &mut LoadState) {
    let now = Instant::now();
    let dt = now.duration_since(state.last).as_secs_f64();
    if dt > 0.0 {
        state.rate *= 0.5f64.powf(dt / LoadMeter::HALF_LIFE_SECS);
        state.last = now;
    }
}

/// Per-peer trust and bandwidth preference.
///
/// Trust is monotonic bookkeeping saturating at zero on the low side;
/// preference is an additive score that decays exponentially and feeds
/// bandwidth arbitration and forwarding-set selection.
#[derive(Debug)]
pub struct PeerScore {
    trust: u32,
    preference: f64,
    last_decay: Instant,
}

impl PeerScore {
    /// Preference half-life in seconds.
    const PREF_HALF_LIFE_SECS: f64 = 60.0;

    pub fn new() -> Self {
        Self {
            trust: 0,
            preference: 0.0,
            last_decay: Instant::now(),
        }
    }

    pub fn trust(&self) -> u32 {
        self.trust
    }

    /// Adjust trust; negative deltas saturate at zero.
    pub fn change_trust(&mut self, delta: i32) {
        if delta >= 0 {
            self.trust = self.trust.saturating_add(delta as u32);
        } else {
            self.trust = self.trust.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Add to the decaying preference.
    pub fn prefer(&mut self, amount: f64) {
        self.decay_preference();
        self.preference += amount.max(0.0);
    }

    /// Current preference after decay.
    pub fn preference(&mut self) -> f64 {
        self.decay_preference();
        self.preference
    }

    fn decay_preference(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_decay).as_secs_f64();
        if dt > 0.0 {
            self.preference *= 0.5f64.powf(dt / Self::PREF_HALF_LIFE_SECS);
            self.last_decay = now;
        }
    }
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_curve_contract() {
        // The exact table from the admission contract.
        for load in [0u32, 25, 50] {
            assert!(admit(load, 0), "load {load} must always send");
        }
        // 51%: threshold 1
        assert!(!admit(51, 0));
        assert!(admit(51, 1));
        // 75%: threshold 15625
        assert!(!admit(75, 15_624));
        assert!(admit(75, 15_625));
        // 100%: threshold 125000
        assert!(!admit(100, 124_999));
        assert!(admit(100, 125_000));
        // above 100: only EXTREME
        assert!(!admit(101, 125_000));
        assert!(admit(101, EXTREME_PRIORITY));
        assert!(admit(149, EXTREME_PRIORITY));
        // hard cutoff
        assert!(!admit(150, EXTREME_PRIORITY));
        assert!(!admit(150, u32::MAX));
    }

    #[test]
    fn test_cubic_boundary_at_52() {
        // (52 - 50)^3 = 8
        assert!(!admit(52, 7));
        assert!(admit(52, 8));
    }

    #[test]
    fn test_load_meter_rises_and_decays() {
        let meter = LoadMeter::new(1000);
        assert_eq!(meter.load_percent(), 0);
        meter.record(10_000);
        assert!(meter.load_percent() > 100);
    }

    #[test]
    fn test_load_meter_caps_at_150() {
        let meter = LoadMeter::new(1);
        meter.record(1_000_000);
        assert_eq!(meter.load_percent(), 150);
    }

    #[test]
    fn test_trust_saturates_at_zero() {
        let mut score = PeerScore::new();
        score.change_trust(5);
        assert_eq!(score.trust(), 5);
        score.change_trust(-100);
        assert_eq!(score.trust(), 0);
    }

    #[test]
    fn test_preference_accumulates() {
        let mut score = PeerScore::new();
        score.prefer(10.0);
        score.prefer(5.0);
        assert!(score.preference() > 10.0);
    }
}
