//! Outbound event delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use coentro_ipc::Event;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Destination for events produced by the coordinator.
///
/// `send_event` is called from state listeners and must not block.
pub trait EventSink: Send + Sync {
    fn send_event(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn send_event(&self, event: Event) {
        if self.send(event).is_err() {
            trace!("Event receiver dropped, discarding event");
        }
    }
}

/// Identifies a registered IPC peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

/// Fans events out to every connected IPC peer.
#[derive(Default)]
pub struct PeerEvents {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Event>>>,
    next_id: AtomicU64,
}

impl PeerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<Event>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a peer and return the stream of events destined for it.
    pub fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<Event>) {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers().insert(id, tx);
        debug!(peer = id.0, "Peer registered for events");
        (id, rx)
    }

    pub fn unregister(&self, id: PeerId) {
        if self.peers().remove(&id).is_some() {
            debug!(peer = id.0, "Peer unregistered");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }
}

impl EventSink for PeerEvents {
    fn send_event(&self, event: Event) {
        let mut peers = self.peers();
        peers.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(peer = id.0, "Dropping disconnected peer");
            }
            delivered
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coentro_ipc::{AccountHistory, LoginResult};

    #[test]
    fn test_fan_out_and_prune() {
        let peers = PeerEvents::new();
        let (_first, mut first_rx) = peers.register();
        let (_second, second_rx) = peers.register();
        assert_eq!(peers.peer_count(), 2);

        drop(second_rx);
        peers.send_event(Event::Login(LoginResult::Ok));

        assert_eq!(first_rx.try_recv().unwrap(), Event::Login(LoginResult::Ok));
        assert_eq!(peers.peer_count(), 1);
    }

    #[test]
    fn test_unregister() {
        let peers = PeerEvents::new();
        let (id, mut rx) = peers.register();
        peers.unregister(id);

        peers.send_event(Event::AccountHistory(AccountHistory::WithoutHistory));
        assert!(rx.try_recv().is_err());
        assert_eq!(peers.peer_count(), 0);
    }
}
