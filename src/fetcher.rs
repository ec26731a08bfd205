//! Concurrent fetch loop: assigns queued work to idle peers and tracks
//! delivery, timeouts, and peer churn for one sync cycle.

use crate::error::FetchError;
use crate::heap::DeadlineHeap;
use crate::peers::{Peer, PeerEvent, PeerEventKind, PeerId, PeerPool};
use crate::queue::{FetchRequest, Response, TypedQueue};
use crate::rates::RateTracker;
use crate::stats::FetchStats;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

/// How long a peer may sit on an already timed-out request before it is
/// considered to be stalling on purpose. Timeouts themselves are not
/// penalized, a peer might be temporarily overloaded, but it still must
/// answer every request eventually.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2 * 60);

/// Buffer of the peer lifecycle subscription, burst protection only.
const DEFAULT_EVENT_CHANNEL_BUFFER: usize = 64;

/// Expired item count above which a timeout is attributed to our own
/// capacity overestimate rather than to the peer.
const CAPACITY_RESET_FAILS: usize = 2;

/// Knobs for one fetch cycle.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Grace allowed for a response to a locally timed-out request before
    /// the peer is dropped as stalling.
    pub grace_period: Duration,
    /// Keep running with an empty or unproductive peer set; an external
    /// coordinator is expected to supply peers eventually.
    pub beacon_mode: bool,
    /// Buffer of the peer event subscription.
    pub event_channel_buffer: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            beacon_mode: false,
            event_channel_buffer: DEFAULT_EVENT_CHANNEL_BUFFER,
        }
    }
}

/// Iteratively download scheduled items, reserving a chunk of work for each
/// available peer and waiting for delivery or timeout.
///
/// Runs until the queue's task source is exhausted and drained, or until a
/// terminal condition: cancellation, loss of all peers, an unproductive
/// peer set, a master peer timeout, or invalid data.
pub async fn concurrent_fetch<Q: TypedQueue>(
    queue: &Q,
    peers: &PeerPool,
    rates: &RateTracker,
    config: &FetcherConfig,
    master_peer: Option<PeerId>,
    mut cancel: watch::Receiver<bool>,
    stats: Option<Arc<FetchStats>>,
) -> Result<(), FetchError> {
    // Rendezvous-style delivery channel: transports park in send until the
    // loop consumes, which is the whole backpressure story.
    let (responses_tx, mut responses_rx) = mpsc::channel(1);
    let mut events = peers.subscribe_events(config.event_channel_buffer);
    let mut waker = queue.waker();

    let mut cycle = FetchCycle {
        queue,
        peers,
        rates,
        config,
        master_peer,
        stats,
        responses_tx,
        pending: HashMap::new(),
        stales: HashMap::new(),
        heap: DeadlineHeap::new(),
        finished: false,
    };
    let result = cycle
        .run(&mut cancel, &mut events, &mut responses_rx, &mut waker)
        .await;

    // Abort everything still in flight. The remote side may yet answer,
    // but nobody is listening and blocked senders must be released.
    cycle.close_all();
    result
}

struct FetchCycle<'a, Q: TypedQueue> {
    queue: &'a Q,
    peers: &'a PeerPool,
    rates: &'a RateTracker,
    config: &'a FetcherConfig,
    master_peer: Option<PeerId>,
    stats: Option<Arc<FetchStats>>,
    responses_tx: mpsc::Sender<Response>,
    /// Peers with an un-timed-out request in flight. At most one per peer.
    pending: HashMap<PeerId, Arc<FetchRequest>>,
    /// Peers whose request timed out but has not been answered yet. Kept
    /// so the peer stays marked busy and a late response can still drain
    /// it. Disjoint from `pending`.
    stales: HashMap<PeerId, Arc<FetchRequest>>,
    heap: DeadlineHeap,
    finished: bool,
}

impl<Q: TypedQueue> FetchCycle<'_, Q> {
    async fn run(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
        events: &mut mpsc::Receiver<PeerEvent>,
        responses: &mut mpsc::Receiver<Response>,
        waker: &mut mpsc::Receiver<bool>,
    ) -> Result<(), FetchError> {
        let timer = sleep_until(Instant::now());
        tokio::pin!(timer);
        let mut timer_deadline: Option<Instant> = None;
        let mut waker_open = true;

        loop {
            // Short circuit if we lost all our peers.
            if self.peers.is_empty() && !self.config.beacon_mode {
                return Err(FetchError::NoPeers);
            }
            if self.queue.pending() == 0 {
                if self.pending.is_empty() && self.finished {
                    return Ok(());
                }
            } else {
                self.assign_idle_peers()?;
            }

            // Keep the timer in lockstep with the earliest deadline.
            match self.heap.peek().map(|(deadline, _)| deadline) {
                Some(deadline) => {
                    if timer_deadline != Some(deadline) {
                        timer.as_mut().reset(deadline);
                        timer_deadline = Some(deadline);
                    }
                }
                None => timer_deadline = None,
            }

            tokio::select! {
                changed = cancel.changed() => {
                    // Pending requests are canceled locally; remote
                    // responses get dropped at the channel when they arrive.
                    if changed.is_err() || *cancel.borrow() {
                        return Err(FetchError::Canceled);
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_peer_event(event),
                        // Our subscription overflowed or the pool went away.
                        None => return Err(FetchError::SubscriptionLost),
                    }
                }
                () = &mut timer, if timer_deadline.is_some() => {
                    timer_deadline = None;
                    self.handle_timeout()?;
                }
                response = responses.recv() => {
                    if let Some(response) = response {
                        self.handle_delivery(response)?;
                    }
                }
                wake = waker.recv(), if waker_open => {
                    match wake {
                        // More fetches queued up; loop back to assignment.
                        Some(true) => {}
                        Some(false) => self.finished = true,
                        None => {
                            self.finished = true;
                            waker_open = false;
                        }
                    }
                }
            }
        }
    }

    /// Send a download request to every idle peer, until throttled or out
    /// of queued tasks.
    fn assign_idle_peers(&mut self) -> Result<(), FetchError> {
        let now = Instant::now();
        let mut idles: Vec<(Peer, usize)> = Vec::new();
        for peer in self.peers.all_peers() {
            if self.pending.contains_key(&peer.id) {
                continue;
            }
            if let Some(request) = self.stales.get(&peer.id) {
                let waited = now.saturating_duration_since(request.sent_at());
                if waited > self.config.grace_period {
                    // In flight longer than the grace permits: the peer is
                    // stalling the sync on purpose.
                    warn!(
                        peer_id = %peer.id,
                        waited_ms = waited.as_millis() as u64,
                        "peer stalling, dropping"
                    );
                    self.peers.drop_peer(&peer.id);
                    if let Some(stats) = &self.stats {
                        stats.record_peer_dropped();
                    }
                }
                continue;
            }
            let capacity = self.queue.capacity(&peer.id, Duration::from_secs(1));
            idles.push((peer, capacity));
        }
        // Highest estimated capacity first; the stable sort keeps join
        // order on ties.
        idles.sort_by_key(|(_, capacity)| std::cmp::Reverse(*capacity));

        let mut progressed = false;
        let mut throttled = false;
        let mut queued = self.queue.pending();
        for (peer, _) in &idles {
            if throttled {
                break;
            }
            queued = self.queue.pending();
            if queued == 0 {
                break;
            }
            // An absent reservation can mean either that nothing is left
            // to hand out, or that the peer is known not to have it.
            let target_rtt = self.rates.target_round_trip();
            let outcome = self
                .queue
                .reserve(&peer.id, self.queue.capacity(&peer.id, target_rtt));
            if outcome.progressed {
                progressed = true;
            }
            if outcome.throttled {
                throttled = true;
                if let Some(stats) = &self.stats {
                    stats.record_throttled();
                }
            }
            let Some(reservation) = outcome.reservation else {
                continue;
            };
            let request = match self.queue.request(peer, reservation, self.responses_tx.clone()) {
                Ok(request) => request,
                Err(err) => {
                    // The peer usually disconnected between selection and
                    // send. Removal will return its tasks asynchronously,
                    // but pushing the unfulfilled items back right away is
                    // better.
                    debug!(peer_id = %peer.id, error = %err, "request dispatch failed");
                    self.queue.unreserve(&peer.id);
                    continue;
                }
            };
            self.pending.insert(peer.id.clone(), Arc::clone(&request));
            let deadline = Instant::now() + self.rates.target_timeout();
            self.heap.push(deadline, request);
            if let Some(stats) = &self.stats {
                stats.record_assignment();
            }
        }
        // Every connected peer was tried, none could take work, and tasks
        // remain queued: this peer set cannot make progress.
        if !progressed
            && !throttled
            && self.pending.is_empty()
            && idles.len() == self.peers.len()
            && queued > 0
            && !self.config.beacon_mode
        {
            return Err(FetchError::PeersUnavailable);
        }
        Ok(())
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let peer_id = event.peer.id;
        match event.kind {
            PeerEventKind::Join => {
                // A joining peer cannot have work in flight; anything else
                // is an internal bookkeeping bug, not worth dying over.
                if self.pending.contains_key(&peer_id) {
                    error!(peer_id = %peer_id, "pending request exists for joining peer");
                }
                if self.stales.contains_key(&peer_id) {
                    error!(peer_id = %peer_id, "stale request exists for joining peer");
                }
                // Loop back to the assignment pass.
            }
            PeerEventKind::Leave => {
                if let Some(request) = self.pending.remove(&peer_id) {
                    self.queue.unreserve(&peer_id);
                    self.heap.remove(request.id());
                    request.close();
                }
                if let Some(request) = self.stales.remove(&peer_id) {
                    request.close();
                }
            }
        }
    }

    fn handle_timeout(&mut self) -> Result<(), FetchError> {
        // Given correct arming there is no order of events that fires the
        // timer without a scheduled deadline; the checks below only catch
        // programming errors.
        let Some((deadline, request)) = self
            .heap
            .peek()
            .map(|(deadline, request)| (deadline, Arc::clone(request)))
        else {
            error!("timeout fired with no scheduled deadlines");
            return Ok(());
        };
        let now = Instant::now();
        if now < deadline {
            error!(
                left_ms = (deadline - now).as_millis() as u64,
                "timeout triggered but not reached"
            );
            return Ok(());
        }
        // Stop tracking the request from a timing perspective, but keep the
        // peer marked busy: a second request would only overload it further,
        // and a late response must still be able to drain it.
        let peer_id = request.peer().to_string();
        self.pending.remove(&peer_id);
        self.stales.insert(peer_id.clone(), request);
        self.heap.pop();
        if let Some(stats) = &self.stats {
            stats.record_timeout();
        }

        let fails = self.queue.unreserve(&peer_id);

        let Some(peer) = self.peers.peer(&peer_id) else {
            // A disconnect should have short-circuited this already; leave
            // the check in for strange codepaths.
            error!(peer_id = %peer_id, "delivery timeout from unknown peer");
            return Ok(());
        };
        if fails > CAPACITY_RESET_FAILS {
            // A lot of items expired at once: we overestimated the peer, or
            // perhaps ourselves. Deflate to minimal throughput, don't drop.
            self.queue.update_capacity(&peer.id, 0, Duration::ZERO);
        } else {
            debug!(peer_id = %peer.id, fails, "peer timed out, dropping");
            self.peers.drop_peer(&peer.id);
            if let Some(stats) = &self.stats {
                stats.record_peer_dropped();
            }
            if self.master_peer.as_deref() == Some(peer.id.as_str()) {
                return Err(FetchError::Timeout);
            }
        }
        Ok(())
    }

    fn handle_delivery(&mut self, mut response: Response) -> Result<(), FetchError> {
        // The response may race its own timeout. Whichever was handled
        // first won; the loser becomes a no-op for this request.
        self.heap.remove(response.request_id);
        let in_pending = self
            .pending
            .get(&response.peer)
            .is_some_and(|request| request.id() == response.request_id);
        let request = if in_pending {
            self.pending.remove(&response.peer)
        } else {
            let in_stales = self
                .stales
                .get(&response.peer)
                .is_some_and(|request| request.id() == response.request_id);
            if in_stales {
                self.stales.remove(&response.peer)
            } else {
                None
            }
        };

        // Signal the dispatcher that the round trip is done, then release
        // the request. The peer gets dropped later if the data is junk.
        if let Some(done) = response.done.take() {
            let _ = done.send(());
        }
        if let Some(request) = &request {
            request.close();
        }

        let Some(peer) = self.peers.peer(&response.peer) else {
            // Dropped while its response was in flight; nothing to credit.
            return Ok(());
        };
        let delivered = self.queue.deliver(&peer, &response);
        match delivered.error {
            Some(crate::error::DeliverError::InvalidChain(reason)) => {
                return Err(FetchError::InvalidChain(reason));
            }
            // The peer answered something else than asked, usually a timed
            // out request coming through in the end. Stale data says
            // nothing about current throughput, so skip the update.
            Some(crate::error::DeliverError::Stale) => {
                if let Some(stats) = &self.stats {
                    stats.record_stale();
                }
            }
            None => {
                self.queue
                    .update_capacity(&peer.id, delivered.accepted, response.elapsed);
                if let Some(stats) = &self.stats {
                    stats.record_delivery(delivered.accepted);
                }
            }
        }
        Ok(())
    }

    fn close_all(&self) {
        for request in self.pending.values().chain(self.stales.values()) {
            request.close();
        }
    }
}
