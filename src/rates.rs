//! Adaptive per-peer throughput and round trip estimation.
//!
//! Feeds admission control in the fetch loop: reservations are sized from a
//! peer's estimated items-per-second over the global target round trip, and
//! request deadlines are armed from the target timeout derived from it.

use crate::peers::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Impact a single measurement has on a peer's prior estimate.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Deliberate overshoot applied to measured throughput so estimates keep
/// probing upward instead of converging from below.
const CAPACITY_OVERESTIMATION: f64 = 1.01;

#[derive(Debug, Clone)]
pub struct RateTrackerConfig {
    /// Floor for a peer's sustained capacity, in items per second. Held at
    /// 2 rather than 1 so the estimator can still measure by perturbation:
    /// requesting one more than the true minimum shows how response times
    /// react.
    pub min_capacity: f64,
    /// Lower clamp on the global round trip target.
    pub rtt_min_estimate: Duration,
    /// Upper clamp on the global round trip target, and the default before
    /// any peer has been measured.
    pub rtt_max_estimate: Duration,
    /// Multiplier below 1 applied to the measured median, so the target
    /// keeps pushing downward against slow peers.
    pub rtt_pushdown: f64,
    /// Hard deadline as a multiple of the round trip target. Must exceed 1.
    pub ttl_scaling: u32,
    /// Cap on the hard deadline regardless of scaling.
    pub ttl_limit: Duration,
}

impl Default for RateTrackerConfig {
    fn default() -> Self {
        Self {
            min_capacity: 2.0,
            rtt_min_estimate: Duration::from_secs(2),
            rtt_max_estimate: Duration::from_secs(20),
            rtt_pushdown: 0.9,
            ttl_scaling: 3,
            ttl_limit: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerRate {
    /// Estimated sustained delivery rate, items per second.
    capacity: f64,
    /// Smoothed round trip time observed for this peer.
    roundtrip: Duration,
}

/// Thread-safe tracker of per-peer delivery rates.
#[derive(Debug, Default)]
pub struct RateTracker {
    config: RateTrackerConfig,
    peers: RwLock<HashMap<PeerId, PeerRate>>,
}

impl RateTracker {
    pub fn new(config: RateTrackerConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a peer. Newcomers inherit the mean capacity of the
    /// current set so they get a fair first assignment, and the current
    /// round trip target as their starting latency.
    pub fn track(&self, peer: PeerId) {
        let roundtrip = self.target_round_trip();
        let mut peers = self.peers.write();
        let capacity = if peers.is_empty() {
            self.config.min_capacity
        } else {
            let sum: f64 = peers.values().map(|rate| rate.capacity).sum();
            (sum / peers.len() as f64).max(self.config.min_capacity)
        };
        peers
            .entry(peer)
            .or_insert(PeerRate { capacity, roundtrip });
    }

    /// Forget a peer entirely.
    pub fn untrack(&self, peer: &str) {
        self.peers.write().remove(peer);
    }

    /// Items `peer` is estimated to retrieve within `rtt`. Unknown peers
    /// read as the floor. Always at least 1 so progress can be measured.
    pub fn capacity(&self, peer: &str, rtt: Duration) -> usize {
        let peers = self.peers.read();
        let throughput = peers
            .get(peer)
            .map_or(self.config.min_capacity, |rate| rate.capacity);
        1 + (throughput * rtt.as_secs_f64()) as usize
    }

    /// Fold a delivery measurement into the estimate for `peer`.
    ///
    /// `items == 0 && elapsed == 0` is the reset call: the peer drops to
    /// the capacity floor but stays tracked, used after repeated timeouts
    /// that are attributed to our own overestimate.
    pub fn update(&self, peer: &str, items: usize, elapsed: Duration) {
        let mut peers = self.peers.write();
        let Some(rate) = peers.get_mut(peer) else {
            return;
        };
        if elapsed.is_zero() {
            if items == 0 {
                rate.capacity = self.config.min_capacity;
            }
            // Items with no measurable elapsed time are an outlier, not a
            // usable rate sample.
            return;
        }
        let measured = items as f64 / elapsed.as_secs_f64();
        rate.capacity = ((1.0 - MEASUREMENT_IMPACT) * rate.capacity
            + MEASUREMENT_IMPACT * measured * CAPACITY_OVERESTIMATION)
            .max(self.config.min_capacity);
        rate.roundtrip = rate.roundtrip.mul_f64(1.0 - MEASUREMENT_IMPACT)
            + elapsed.mul_f64(MEASUREMENT_IMPACT);
    }

    /// The round trip budget used to size reservations: the median of
    /// tracked peer round trips, pushed down and clamped.
    pub fn target_round_trip(&self) -> Duration {
        let peers = self.peers.read();
        let mut rtts: Vec<Duration> = peers.values().map(|rate| rate.roundtrip).collect();
        let estimate = if rtts.is_empty() {
            self.config.rtt_max_estimate
        } else {
            rtts.sort_unstable();
            rtts[rtts.len() / 2].mul_f64(self.config.rtt_pushdown)
        };
        estimate.clamp(self.config.rtt_min_estimate, self.config.rtt_max_estimate)
    }

    /// The hard deadline for a request, strictly greater than the round
    /// trip target.
    pub fn target_timeout(&self) -> Duration {
        (self.target_round_trip() * self.config.ttl_scaling).min(self.config.ttl_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peers_read_as_the_floor() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        assert_eq!(rates.capacity("ghost", Duration::from_secs(1)), 3);
        // A measurement for an untracked peer is discarded, not recorded.
        rates.update("ghost", 100, Duration::from_secs(1));
        assert_eq!(rates.capacity("ghost", Duration::from_secs(1)), 3);
    }

    #[test]
    fn updates_pull_the_estimate_toward_measurements() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        rates.track("a".to_string());
        let before = rates.capacity("a", Duration::from_secs(1));

        for _ in 0..50 {
            rates.update("a", 100, Duration::from_secs(1));
        }
        let after = rates.capacity("a", Duration::from_secs(1));
        assert!(after > before, "estimate should grow: {before} -> {after}");
        assert!(after <= 102, "overshoot stays bounded: {after}");
    }

    #[test]
    fn reset_call_drops_to_the_floor() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        rates.track("a".to_string());
        for _ in 0..50 {
            rates.update("a", 100, Duration::from_secs(1));
        }
        assert!(rates.capacity("a", Duration::from_secs(1)) > 3);

        rates.update("a", 0, Duration::ZERO);
        assert_eq!(rates.capacity("a", Duration::from_secs(1)), 3);
    }

    #[test]
    fn zero_elapsed_with_items_is_not_a_reset() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        rates.track("a".to_string());
        for _ in 0..50 {
            rates.update("a", 100, Duration::from_secs(1));
        }
        let before = rates.capacity("a", Duration::from_secs(1));
        assert!(before > 3);

        // A delivery whose measured time rounded to zero carries no usable
        // rate; it must neither floor the peer nor blow up the estimate.
        rates.update("a", 5, Duration::ZERO);
        assert_eq!(rates.capacity("a", Duration::from_secs(1)), before);
    }

    #[test]
    fn timeout_strictly_exceeds_round_trip() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        assert!(rates.target_timeout() > rates.target_round_trip());

        rates.track("a".to_string());
        for _ in 0..100 {
            rates.update("a", 10, Duration::from_millis(50));
        }
        assert!(rates.target_timeout() > rates.target_round_trip());
    }

    #[test]
    fn round_trip_target_tracks_the_median() {
        let config = RateTrackerConfig {
            rtt_min_estimate: Duration::from_millis(10),
            ..RateTrackerConfig::default()
        };
        let rates = RateTracker::new(config);
        for (peer, rtt_ms) in [("a", 100u64), ("b", 4_000), ("c", 30_000)] {
            rates.track(peer.to_string());
            for _ in 0..200 {
                rates.update(peer, 10, Duration::from_millis(rtt_ms));
            }
        }
        let target = rates.target_round_trip();
        // The slow outlier must not dominate: the target sits near the
        // median peer, pushed down by the probe factor.
        assert!(target < Duration::from_secs(5), "target too high: {target:?}");
        assert!(target > Duration::from_secs(1), "target too low: {target:?}");
    }

    #[test]
    fn newcomers_inherit_the_mean_capacity() {
        let rates = RateTracker::new(RateTrackerConfig::default());
        rates.track("fast".to_string());
        for _ in 0..100 {
            rates.update("fast", 200, Duration::from_secs(1));
        }

        rates.track("new".to_string());
        assert!(
            rates.capacity("new", Duration::from_secs(1)) > 50,
            "newcomer should not start at the floor next to a proven peer"
        );
    }
}
