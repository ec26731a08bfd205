//! Shared counters for fetch scheduler visibility.

use std::sync::atomic::{AtomicU64, Ordering};

/// Activity counters for one fetch cycle, safe to read from other threads
/// while the loop runs.
#[derive(Debug, Default)]
pub struct FetchStats {
    requests_assigned: AtomicU64,
    responses_delivered: AtomicU64,
    items_accepted: AtomicU64,
    timeouts: AtomicU64,
    stale_deliveries: AtomicU64,
    throttled_rounds: AtomicU64,
    peers_dropped: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStatsSnapshot {
    pub requests_assigned: u64,
    pub responses_delivered: u64,
    pub items_accepted: u64,
    pub timeouts: u64,
    pub stale_deliveries: u64,
    pub throttled_rounds: u64,
    pub peers_dropped: u64,
}

impl FetchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_assignment(&self) {
        self.requests_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, accepted: usize) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
        self.items_accepted
            .fetch_add(accepted as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled(&self) {
        self.throttled_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_peer_dropped(&self) {
        self.peers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            requests_assigned: self.requests_assigned.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            items_accepted: self.items_accepted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_deliveries: self.stale_deliveries.load(Ordering::Relaxed),
            throttled_rounds: self.throttled_rounds.load(Ordering::Relaxed),
            peers_dropped: self.peers_dropped.load(Ordering::Relaxed),
        }
    }
}
