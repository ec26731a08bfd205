//! Concurrent fetch scheduler for peer-to-peer block synchronization.
//!
//! The crate multiplexes a stream of typed retrieval tasks across a dynamic
//! set of remote peers: one in-flight request per peer, reservations sized
//! from adaptive per-peer rate estimates, per-request deadlines with a
//! grace period for late answers, and deterministic reassignment when a
//! peer fails or leaves.
//!
//! [`fetcher::concurrent_fetch`] is the entry point. It is polymorphic over
//! a [`queue::TypedQueue`], so header, body, and receipt queues all drive
//! the same loop while keeping their payload types to themselves. Peers
//! arrive and depart through a [`peers::PeerPool`], and the
//! [`rates::RateTracker`] turns delivery measurements into the round trip
//! and timeout budgets the loop schedules against.

pub mod error;
pub mod fetcher;
pub mod heap;
pub mod peers;
pub mod queue;
pub mod rates;
pub mod stats;

pub use error::{DeliverError, DispatchError, FetchError, InvalidHeapIndex};
pub use fetcher::{concurrent_fetch, FetcherConfig};
pub use heap::DeadlineHeap;
pub use peers::{Peer, PeerEvent, PeerEventKind, PeerId, PeerPool};
pub use queue::{Delivered, FetchRequest, Reserved, Response, TypedQueue};
pub use rates::{RateTracker, RateTrackerConfig};
pub use stats::{FetchStats, FetchStatsSnapshot};
