//! Peer membership and lifecycle event bus.

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Opaque peer identity assigned by the external peer manager.
pub type PeerId = String;

/// A connected remote peer as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    Join,
    Leave,
}

/// A membership change broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: Peer,
    pub kind: PeerEventKind,
}

#[derive(Debug, Default)]
struct Inner {
    peers: Vec<Peer>,
    subscribers: Vec<mpsc::Sender<PeerEvent>>,
}

/// The set of peers available for task assignment.
///
/// Membership changes and event emission happen under one lock, so an
/// enumeration is always a consistent snapshot relative to the most recent
/// event a subscriber has consumed. Subscription channels are bounded; a
/// subscriber that falls behind loses its subscription and must treat the
/// closed channel as fatal for the cycle.
#[derive(Debug, Default)]
pub struct PeerPool {
    inner: RwLock<Inner>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Snapshot of all connected peers in insertion order.
    pub fn all_peers(&self) -> Vec<Peer> {
        self.inner.read().peers.clone()
    }

    /// Look up a peer by id. Callers must tolerate `None`: the peer may
    /// have left between an event and this lookup.
    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.inner.read().peers.iter().find(|p| p.id == id).cloned()
    }

    /// Add a peer and announce the join. Returns false on duplicate ids,
    /// in which case nothing is announced.
    pub fn register(&self, peer: Peer) -> bool {
        let mut inner = self.inner.write();
        if inner.peers.iter().any(|existing| existing.id == peer.id) {
            return false;
        }
        inner.peers.push(peer.clone());
        Self::broadcast(
            &mut inner,
            PeerEvent {
                peer,
                kind: PeerEventKind::Join,
            },
        );
        true
    }

    /// Remove a peer and announce the leave. Returns false if the id was
    /// not registered.
    pub fn drop_peer(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.peers.iter().position(|p| p.id == id) else {
            return false;
        };
        let peer = inner.peers.remove(pos);
        Self::broadcast(
            &mut inner,
            PeerEvent {
                peer,
                kind: PeerEventKind::Leave,
            },
        );
        true
    }

    /// Subscribe to membership events through a bounded channel.
    ///
    /// If the buffer overflows the subscription is dropped rather than
    /// blocking the producer; the receiver then observes a closed channel.
    pub fn subscribe_events(&self, buffer: usize) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.inner.write().subscribers.push(tx);
        rx
    }

    fn broadcast(inner: &mut Inner, event: PeerEvent) {
        inner.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    peer_id = %event.peer.id,
                    "peer event subscriber lagging, dropping subscription"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announces_joins_and_leaves() {
        let pool = PeerPool::new();
        let mut events = pool.subscribe_events(8);

        assert!(pool.register(Peer::new("a")));
        assert!(pool.register(Peer::new("b")));
        assert!(!pool.register(Peer::new("a")), "duplicate join rejected");
        assert!(pool.drop_peer("a"));
        assert!(!pool.drop_peer("a"), "double drop rejected");

        let event = events.recv().await.expect("join a");
        assert_eq!(event.peer.id, "a");
        assert_eq!(event.kind, PeerEventKind::Join);
        let event = events.recv().await.expect("join b");
        assert_eq!(event.peer.id, "b");
        let event = events.recv().await.expect("leave a");
        assert_eq!(event.peer.id, "a");
        assert_eq!(event.kind, PeerEventKind::Leave);

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peer("b").map(|p| p.id), Some("b".to_string()));
        assert!(pool.peer("a").is_none());
    }

    #[tokio::test]
    async fn snapshot_keeps_insertion_order() {
        let pool = PeerPool::new();
        for id in ["c", "a", "b"] {
            pool.register(Peer::new(id));
        }
        let ids: Vec<_> = pool.all_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn overflow_drops_the_subscription() {
        let pool = PeerPool::new();
        let mut events = pool.subscribe_events(1);

        // The first event fills the buffer, the second overflows it and
        // the subscription is discarded.
        pool.register(Peer::new("a"));
        pool.register(Peer::new("b"));

        let event = events.recv().await.expect("buffered event survives");
        assert_eq!(event.peer.id, "a");
        assert!(events.recv().await.is_none(), "channel closed after overflow");

        // The pool itself is unaffected.
        assert_eq!(pool.len(), 2);
    }
}
