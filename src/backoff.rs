//! Per-entry tick backoff
//!
//! Entries that keep failing inside a tick are skipped for a doubling
//! number of subsequent ticks, capped, so one bad medium cannot dominate
//! the control loop. A success clears the entry.

use std::collections::HashMap;

/// Default cap on the number of ticks an entry can be skipped
pub const DEFAULT_MAX_SKIP_TICKS: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    consecutive_failures: u32,
    retry_at_tick: u64,
}

/// Tracks consecutive per-entry failures across ticks.
#[derive(Debug)]
pub struct EntryBackoff {
    tick: u64,
    max_skip_ticks: u64,
    entries: HashMap<String, BackoffState>,
}

impl Default for EntryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SKIP_TICKS)
    }
}

impl EntryBackoff {
    pub fn new(max_skip_ticks: u64) -> Self {
        Self {
            tick: 0,
            max_skip_ticks,
            entries: HashMap::new(),
        }
    }

    /// Call once at the start of each tick.
    pub fn advance_tick(&mut self) {
        self.tick += 1;
    }

    /// True while the entry is still inside its skip window.
    pub fn should_skip(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|state| state.retry_at_tick > self.tick)
            .unwrap_or(false)
    }

    /// Record a failure; the skip window doubles per consecutive failure.
    pub fn record_failure(&mut self, key: &str) {
        let state = self
            .entries
            .entry(key.to_string())
            .or_insert(BackoffState {
                consecutive_failures: 0,
                retry_at_tick: 0,
            });
        state.consecutive_failures += 1;
        let skip = 1u64
            .checked_shl(state.consecutive_failures - 1)
            .unwrap_or(self.max_skip_ticks)
            .min(self.max_skip_ticks);
        state.retry_at_tick = self.tick + skip;
    }

    /// Clear the entry after a success (or after the failure is resolved
    /// some other way).
    pub fn record_success(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_entries_run_every_tick() {
        let mut backoff = EntryBackoff::default();
        backoff.advance_tick();
        assert!(!backoff.should_skip("pv-a"));
    }

    #[test]
    fn test_skip_doubles_per_failure() {
        let mut backoff = EntryBackoff::default();

        backoff.advance_tick(); // tick 1
        backoff.record_failure("pv-a"); // skip 1 tick
        backoff.advance_tick(); // tick 2
        assert!(!backoff.should_skip("pv-a"));

        backoff.record_failure("pv-a"); // skip 2 ticks
        backoff.advance_tick(); // tick 3
        assert!(backoff.should_skip("pv-a"));
        backoff.advance_tick(); // tick 4
        assert!(!backoff.should_skip("pv-a"));
    }

    #[test]
    fn test_skip_is_capped() {
        let mut backoff = EntryBackoff::new(4);
        backoff.advance_tick();
        for _ in 0..32 {
            backoff.record_failure("pv-a");
        }
        for _ in 0..4 {
            backoff.advance_tick();
        }
        // 32 failures would be 2^31 ticks uncapped; the cap bounds it to 4.
        assert!(!backoff.should_skip("pv-a"));
    }

    #[test]
    fn test_success_clears_entry() {
        let mut backoff = EntryBackoff::default();
        backoff.advance_tick();
        backoff.record_failure("pv-a");
        backoff.record_failure("pv-a");
        backoff.record_success("pv-a");
        backoff.advance_tick();
        assert!(!backoff.should_skip("pv-a"));
    }
}
