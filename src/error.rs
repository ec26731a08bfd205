//! Error taxonomy for the fetch scheduler.

use thiserror::Error;

/// Terminal errors returned by [`concurrent_fetch`](crate::fetcher::concurrent_fetch).
///
/// Local failures (dispatch errors, stale deliveries) are absorbed by the
/// loop and never surface through this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The peer set went empty outside of beacon mode.
    #[error("no peers available for fetching")]
    NoPeers,

    /// Every connected peer was idle, none could take work, and tasks
    /// remained queued.
    #[error("no connected peers able to make progress")]
    PeersUnavailable,

    /// The outer coordinator aborted the sync cycle.
    #[error("fetch cycle canceled")]
    Canceled,

    /// The master peer timed out with few enough expired items that the
    /// failure is attributed to the peer itself.
    #[error("master peer timed out")]
    Timeout,

    /// The queue rejected a delivery as violating chain validity.
    #[error("invalid chain segment: {0}")]
    InvalidChain(String),

    /// The peer event subscription overflowed or closed unexpectedly.
    #[error("peer event subscription lost")]
    SubscriptionLost,
}

/// Failure to hand a request to the transport, usually because the peer
/// disconnected between selection and send. The scheduler reacts by
/// unreserving the allocation and moving on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request dispatch to {peer} failed: {reason}")]
pub struct DispatchError {
    pub peer: String,
    pub reason: String,
}

/// Delivery failure reported by [`TypedQueue::deliver`](crate::queue::TypedQueue::deliver).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliverError {
    /// The delivered data does not extend the chain being synced. Fatal for
    /// the whole cycle.
    #[error("invalid chain segment: {0}")]
    InvalidChain(String),

    /// The delivery answered an already expired request. The response still
    /// drains the peer, but says nothing about its current throughput.
    #[error("stale delivery")]
    Stale,
}

/// Removal was attempted at a heap slot that does not exist.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("heap index {index} out of bounds for {len} entries")]
pub struct InvalidHeapIndex {
    pub index: usize,
    pub len: usize,
}
