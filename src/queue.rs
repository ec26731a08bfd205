//! Typed queue adapter: the seam between the scheduler and payload-specific
//! work queues.
//!
//! Concrete queues (headers, bodies, receipts) vary only in payload type and
//! decoder; the scheduler stays type-agnostic by talking through
//! [`TypedQueue`] and moving payloads around as opaque boxes.

use crate::error::{DeliverError, DispatchError};
use crate::peers::{Peer, PeerId};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A single in-flight retrieval: one peer holding one reservation.
///
/// Created by [`TypedQueue::request`] once dispatch succeeds, and shared
/// between the scheduler (which tracks its deadline) and the transport
/// (which answers through the response channel).
pub struct FetchRequest {
    id: u64,
    peer: PeerId,
    sent_at: Instant,
    descriptor: Box<dyn Any + Send + Sync>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("sent_at", &self.sent_at)
            .finish_non_exhaustive()
    }
}

impl FetchRequest {
    /// Create a request for `peer`, stamped with the current time and
    /// carrying the queue's type-erased description of what was asked for.
    ///
    /// The returned receiver fires when the scheduler closes the request,
    /// letting a transport blocked on the response channel bail out.
    pub fn new(
        peer: PeerId,
        descriptor: Box<dyn Any + Send + Sync>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let request = Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            sent_at: Instant::now(),
            descriptor,
            cancel: Mutex::new(Some(cancel_tx)),
        });
        (request, cancel_rx)
    }

    /// Stable identifier correlating responses back to this request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer this request was dispatched to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// When the request was handed to the transport.
    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// The queue's description of the requested items; only the queue that
    /// created the request knows the concrete type.
    pub fn descriptor(&self) -> &(dyn Any + Send + Sync) {
        self.descriptor.as_ref()
    }

    /// Abort the request. Idempotent; only the first call signals the
    /// transport side.
    pub fn close(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }
    }

    /// Whether [`close`](Self::close) has been invoked.
    pub fn is_closed(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

/// A response travelling from a transport task back into the scheduler.
pub struct Response {
    /// Id of the [`FetchRequest`] this answers.
    pub request_id: u64,
    /// The answering peer.
    pub peer: PeerId,
    /// Measured round trip time for the exchange.
    pub elapsed: Duration,
    /// Type-erased payload; [`TypedQueue::deliver`] downcasts it.
    pub payload: Box<dyn Any + Send>,
    /// Signalled once the scheduler has consumed the response, releasing
    /// the dispatcher for the next round trip.
    pub done: Option<oneshot::Sender<()>>,
}

/// Outcome of [`TypedQueue::reserve`].
#[derive(Debug)]
pub struct Reserved<R> {
    /// The allocation, absent when nothing is assignable right now.
    pub reservation: Option<R>,
    /// Whether any pending work was taken by this call. Feeds starvation
    /// detection.
    pub progressed: bool,
    /// Whether the queue's global in-flight budget is saturated. Halts
    /// further assignment this round.
    pub throttled: bool,
}

/// Outcome of [`TypedQueue::deliver`].
#[derive(Debug)]
pub struct Delivered {
    /// Number of items the queue actually accepted.
    pub accepted: usize,
    /// Failure, if any. `InvalidChain` terminates the whole cycle; `Stale`
    /// only suppresses the capacity update.
    pub error: Option<DeliverError>,
}

/// The capability set a payload-specific queue exposes to the concurrent
/// fetcher.
///
/// Implementations are shared with transport tasks on other threads and
/// must be internally synchronized.
pub trait TypedQueue: Send + Sync {
    /// Allocation of pending items to a named peer, surrendered through
    /// [`unreserve`](Self::unreserve).
    type Reservation: Send;

    /// Notification stream pinged when more fetches are queued (`true`) or
    /// when the task source is exhausted (`false`). Called once per cycle.
    fn waker(&self) -> mpsc::Receiver<bool>;

    /// Number of items currently queued for fetching.
    fn pending(&self) -> usize;

    /// How many items `peer` is estimated to retrieve within `rtt`.
    fn capacity(&self, peer: &str, rtt: Duration) -> usize;

    /// Revise the estimate of how many items `peer` retrieves in unit time.
    /// `accepted == 0 && elapsed == 0` resets the peer to the capacity
    /// floor.
    fn update_capacity(&self, peer: &str, accepted: usize, elapsed: Duration);

    /// Allocate up to `items` pending items to `peer`.
    fn reserve(&self, peer: &str, items: usize) -> Reserved<Self::Reservation>;

    /// Drop the retrieval allocation assigned to `peer` and return its
    /// items to the pending pool. Returns the number of items released.
    fn unreserve(&self, peer: &str) -> usize;

    /// Convert a reservation into a typed network request and send it to
    /// the remote peer, answering through `responses`.
    fn request(
        &self,
        peer: &Peer,
        reservation: Self::Reservation,
        responses: mpsc::Sender<Response>,
    ) -> Result<Arc<FetchRequest>, DispatchError>;

    /// Unpack a response and hand the typed data to the queue.
    fn deliver(&self, peer: &Peer, response: &Response) -> Delivered;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_signals_transport_once() {
        let (request, cancel_rx) = FetchRequest::new("peer-1".to_string(), Box::new(()));
        assert!(!request.is_closed());

        request.close();
        assert!(request.is_closed());
        cancel_rx.await.expect("close should signal the receiver");

        // A second close is a no-op.
        request.close();
        assert!(request.is_closed());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let (a, _rx_a) = FetchRequest::new("a".to_string(), Box::new(()));
        let (b, _rx_b) = FetchRequest::new("a".to_string(), Box::new(()));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn descriptor_round_trips_through_the_erasure() {
        let (request, _cancel) = FetchRequest::new("a".to_string(), Box::new(42usize));
        let asked = request.descriptor().downcast_ref::<usize>();
        assert_eq!(asked, Some(&42));
    }
}
