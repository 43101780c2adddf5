//! Fan-out of session messages to N-1 peers with backpressure.
//!
//! One tokio broadcast channel per session: O(1) send to all subscribers,
//! each peer with an independent receiver buffering up to `capacity`
//! messages. Every message is tagged with its originating peer and each
//! [`PeerFeed`] drops its own, so the sender never gets an echo.
//!
//! A receiver that falls more than `capacity` messages behind loses the
//! oldest ones and is told how many; the gateway then resends full state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame and the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub payload: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub receivers: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// The broadcast group of one session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer before lagging peers start
    /// losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Receiver for `peer_id`; messages it originates are filtered out.
    pub fn subscribe(&self, peer_id: Uuid) -> PeerFeed {
        PeerFeed {
            peer_id,
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Encode `msg` once and send it to every subscriber except `origin`.
    ///
    /// Returns the number of receivers the message reached (including the
    /// originator's own, which discards it).
    pub fn fan_out(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.fan_out_raw(origin, Arc::new(msg.encode()?)))
    }

    /// Pre-encoded fast path.
    pub fn fan_out_raw(&self, origin: Uuid, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { origin, payload }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// What a peer's feed produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    Message(Arc<Vec<u8>>),
    /// `n` messages were dropped for this peer.
    Lagged(u64),
    /// The session is gone.
    Closed,
}

/// One peer's view of the session broadcast.
pub struct PeerFeed {
    peer_id: Uuid,
    rx: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl PeerFeed {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Next message from another peer. Cancel safe.
    pub async fn next(&mut self) -> Feed {
        loop {
            match self.rx.recv().await {
                Ok(env) if env.origin == self.peer_id => continue,
                Ok(env) => return Feed::Message(env.payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    return Feed::Lagged(n);
                }
                Err(broadcast::error::RecvError::Closed) => return Feed::Closed,
            }
        }
    }
}
