// src/stats/counters.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a found result as it moves through the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareResult {
    /// A backend produced a qualifying hash
    Found,
    /// The result was handed to the pool
    Submitted,
    /// The pool accepted it
    Accepted,
    /// The pool rejected it
    Rejected,
    /// The pool announced a block
    Block,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiningStats {
    /// Qualifying hashes produced by backends
    pub results_found: u64,
    /// Results sent to pools
    pub results_submitted: u64,
    /// Results accepted by pools
    pub shares_accepted: u64,
    /// Results rejected by pools
    pub shares_rejected: u64,
    /// Blocks announced by pools
    pub blocks_found: u64,
    /// Sum of backend hash rates (H/s)
    pub hash_rate: f64,
    /// Time since the counters were created
    pub uptime: Duration,
}

/// Lock-free share counters shared by the dispatcher and readers
#[derive(Debug)]
pub struct ShareCounters {
    found: AtomicU64,
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    blocks: AtomicU64,
    started: Instant,
}

impl Default for ShareCounters {
    fn default() -> Self {
        ShareCounters {
            found: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ShareCounters {
    /// Counts one outcome
    pub fn record(&self, result: ShareResult) {
        let counter = match result {
            ShareResult::Found => &self.found,
            ShareResult::Submitted => &self.submitted,
            ShareResult::Accepted => &self.accepted,
            ShareResult::Rejected => &self.rejected,
            ShareResult::Block => &self.blocks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values together with the given hash rate
    pub fn snapshot(&self, hash_rate: f64) -> MiningStats {
        MiningStats {
            results_found: self.found.load(Ordering::Relaxed),
            results_submitted: self.submitted.load(Ordering::Relaxed),
            shares_accepted: self.accepted.load(Ordering::Relaxed),
            shares_rejected: self.rejected.load(Ordering::Relaxed),
            blocks_found: self.blocks.load(Ordering::Relaxed),
            hash_rate,
            uptime: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_counters() {
        let counters = ShareCounters::default();
        counters.record(ShareResult::Found);
        counters.record(ShareResult::Found);
        counters.record(ShareResult::Accepted);
        counters.record(ShareResult::Rejected);
        counters.record(ShareResult::Block);

        let stats = counters.snapshot(12.5);
        assert_eq!(stats.results_found, 2);
        assert_eq!(stats.results_submitted, 0);
        assert_eq!(stats.shares_accepted, 1);
        assert_eq!(stats.shares_rejected, 1);
        assert_eq!(stats.blocks_found, 1);
        assert_eq!(stats.hash_rate, 12.5);
    }
}
