//! The bounded peer set.
//!
//! The registry is the sole owner of [`Peer`] values; everything else refers
//! to peers by their advertised host:port and re-resolves on each use. The
//! incoming side is bounded: when admitting one more incoming peer would
//! exceed the limit, the handshake is answered with the current active list
//! so the caller can fall back to one of those peers instead. Outgoing
//! connections do not count toward the limit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use bitbox_proto::{HostPort, Message};

use crate::peer::Peer;

pub struct PeerRegistry {
    local: HostPort,
    max_incoming: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    peers: HashMap<HostPort, Arc<Peer>>,
    /// Dial targets that failed this session; skipped during fallback.
    failed: HashSet<HostPort>,
}

impl PeerRegistry {
    pub fn new(local: HostPort, max_incoming: usize) -> Arc<Self> {
        Arc::new(Self {
            local,
            max_incoming: AtomicUsize::new(max_incoming),
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                failed: HashSet::new(),
            }),
        })
    }

    pub fn local(&self) -> &HostPort {
        &self.local
    }

    /// Hot-reload hook for `maximumIncomingConnections`. Already-admitted
    /// peers are not evicted.
    pub fn set_max_incoming(&self, limit: usize) {
        self.max_incoming.store(limit, Ordering::Relaxed);
    }

    /// Admit an incoming handshake. Refusal returns the current active peer
    /// list for the CONNECTION_REFUSED response.
    pub fn add_incoming(
        &self,
        remote: HostPort,
    ) -> std::result::Result<Arc<Peer>, Vec<HostPort>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let incoming = inner
            .peers
            .values()
            .filter(|peer| !peer.was_outgoing() && peer.state() != crate::peer::PeerState::Closed)
            .count();
        if incoming >= self.max_incoming.load(Ordering::Relaxed)
            || inner.peers.contains_key(&remote)
        {
            return Err(Self::active_of(&inner));
        }
        let peer = Arc::new(Peer::new(remote.clone(), false));
        inner.peers.insert(remote, peer.clone());
        Ok(peer)
    }

    /// Register a dialed peer. `None` when the host:port is already present.
    pub fn add_outgoing(&self, remote: HostPort) -> Option<Arc<Peer>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.peers.contains_key(&remote) {
            return None;
        }
        let peer = Arc::new(Peer::new(remote.clone(), true));
        inner.peers.insert(remote, peer.clone());
        Some(peer)
    }

    /// Drop a peer, closing it. Idempotent.
    pub fn remove(&self, remote: &HostPort) -> Option<Arc<Peer>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let peer = inner.peers.remove(remote)?;
        peer.close();
        debug!(%remote, "peer removed");
        Some(peer)
    }

    pub fn get(&self, remote: &HostPort) -> Option<Arc<Peer>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.peers.get(remote).cloned()
    }

    pub fn contains(&self, remote: &HostPort) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.peers.contains_key(remote)
    }

    pub fn get_active(&self) -> Vec<HostPort> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        Self::active_of(&inner)
    }

    fn active_of(inner: &Inner) -> Vec<HostPort> {
        inner
            .peers
            .values()
            .filter(|peer| peer.is_active())
            .map(|peer| peer.remote().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.get_active().len()
    }

    /// Remember a dial target that failed this session.
    pub fn mark_failed(&self, remote: &HostPort) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.failed.insert(remote.clone());
    }

    /// Filter a CONNECTION_REFUSED peer list down to fallback candidates, in
    /// the order offered: not ourselves, not already connected, not already
    /// failed this session.
    pub fn fallback_candidates(&self, offered: &[HostPort]) -> Vec<HostPort> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        offered
            .iter()
            .filter(|candidate| {
                **candidate != self.local
                    && !inner.peers.contains_key(candidate)
                    && !inner.failed.contains(candidate)
            })
            .cloned()
            .collect()
    }

    /// Enqueue a message to one peer. False when the peer is gone or not
    /// active; callers tolerate absence.
    pub fn send_to(&self, remote: &HostPort, message: Message) -> bool {
        match self.get(remote) {
            Some(peer) => peer.enqueue(message),
            None => false,
        }
    }

    /// Drop queued-but-unsent messages matching the predicate from every
    /// peer's outbound queue. Returns how many peers had something evicted.
    pub fn discard_queued(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        let peers: Vec<Arc<Peer>> = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            inner.peers.values().cloned().collect()
        };
        peers
            .into_iter()
            .filter(|peer| peer.discard_queued_if(&predicate))
            .count()
    }

    /// Enqueue a message to every active peer; returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let peers: Vec<Arc<Peer>> = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            inner.peers.values().cloned().collect()
        };
        peers
            .into_iter()
            .filter(|peer| peer.enqueue(message.clone()))
            .count()
    }

    /// Shutdown: close every connection and forget them.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for peer in inner.peers.values() {
            peer.close();
        }
        inner.peers.clear();
    }
}
