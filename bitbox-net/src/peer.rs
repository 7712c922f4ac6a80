//! Per-peer connection state and the tasks that drive it.
//!
//! A peer starts `Waiting`, becomes `Active` when the handshake completes,
//! and ends `Closed` — a terminal state. While active, a writer task drains
//! the outbound queue in insertion order and a reader loop parses inbound
//! lines, answering protocol violations with `INVALID_PROTOCOL` before
//! tearing the connection down. Everything the rest of the system learns
//! about a connection arrives as a [`PeerEvent`].

use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use bitbox_proto::{codec, HostPort, Message};

use crate::queue::MessageQueue;
use crate::registry::PeerRegistry;
use crate::transport::{Transport, TransportReader, TransportWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Waiting,
    Active,
    Closed,
}

#[derive(Debug)]
pub struct Peer {
    remote: HostPort,
    was_outgoing: bool,
    state: Mutex<PeerState>,
    outbound: MessageQueue<Message>,
    closed: Notify,
}

impl Peer {
    pub(crate) fn new(remote: HostPort, was_outgoing: bool) -> Self {
        Self {
            remote,
            was_outgoing,
            state: Mutex::new(PeerState::Waiting),
            outbound: MessageQueue::new(),
            closed: Notify::new(),
        }
    }

    pub fn remote(&self) -> &HostPort {
        &self.remote
    }

    pub fn was_outgoing(&self) -> bool {
        self.was_outgoing
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub(crate) fn activate(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == PeerState::Waiting {
            *state = PeerState::Active;
        }
    }

    /// Enter the terminal state. The outbound queue stops accepting new
    /// messages but already-queued ones still drain to the writer.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == PeerState::Closed {
                return;
            }
            *state = PeerState::Closed;
        }
        self.outbound.close();
        self.closed.notify_waiters();
    }

    /// Queue a message for delivery. Only active peers accept traffic.
    pub fn enqueue(&self, message: Message) -> bool {
        if !self.is_active() {
            return false;
        }
        self.outbound.add(message)
    }

    /// Drop queued-but-unsent messages matching the predicate. Used to
    /// evict requests a later local change has made moot.
    pub fn discard_queued_if(&self, predicate: impl FnMut(&Message) -> bool) -> bool {
        self.outbound.remove_if(predicate)
    }

    pub(crate) async fn next_outbound(&self) -> Option<Message> {
        self.outbound.take().await
    }

    pub(crate) async fn wait_closed(&self) {
        loop {
            let mut notified = pin!(self.closed.notified());
            notified.as_mut().enable();
            if self.state() == PeerState::Closed {
                return;
            }
            notified.await;
        }
    }
}

/// Notifications from connection tasks to the owning event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; the peer is in the registry and active.
    Activated { remote: HostPort },
    /// A routed protocol message from an active peer.
    Message { remote: HostPort, message: Message },
    /// The connection ended. `fallback` carries the peer list from a
    /// CONNECTION_REFUSED, if that is why it ended.
    Closed {
        remote: HostPort,
        fallback: Vec<HostPort>,
    },
}

/// Shared context for connection tasks.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<PeerRegistry>,
    pub events: mpsc::Sender<PeerEvent>,
    /// Our advertised host:port, sent in handshakes.
    pub local: HostPort,
    pub handshake_timeout: Duration,
    /// Close the connection when nothing arrives for this long.
    pub idle_timeout: Duration,
}

impl ConnectionContext {
    async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Drive an outbound dial: send our handshake, await the verdict.
pub async fn run_outgoing(ctx: ConnectionContext, transport: Transport, remote: HostPort) {
    let (mut reader, mut writer) = transport.split();
    let request = Message::HandshakeRequest {
        host_port: ctx.local.clone(),
    };
    if writer.send_line(&codec::encode(&request)).await.is_err() {
        ctx.registry.mark_failed(&remote);
        ctx.emit(PeerEvent::Closed {
            remote,
            fallback: vec![],
        })
        .await;
        return;
    }

    let line = match timeout(ctx.handshake_timeout, reader.recv_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(_) | Err(_) => {
            debug!(%remote, "handshake failed or timed out");
            ctx.registry.mark_failed(&remote);
            ctx.emit(PeerEvent::Closed {
                remote,
                fallback: vec![],
            })
            .await;
            return;
        }
    };

    match codec::decode(&line) {
        Ok(Message::HandshakeResponse { host_port }) => {
            trace!(%remote, advertised = %host_port, "handshake response");
            let peer = match ctx.registry.add_outgoing(remote.clone()) {
                Some(peer) => peer,
                None => {
                    debug!(%remote, "already connected, dropping duplicate dial");
                    return;
                }
            };
            peer.activate();
            info!(%remote, "connected to peer");
            drive(ctx, peer, reader, writer).await;
        }
        Ok(Message::ConnectionRefused { message, peers }) => {
            info!(%remote, %message, alternates = peers.len(), "connection refused");
            ctx.registry.mark_failed(&remote);
            ctx.emit(PeerEvent::Closed {
                remote,
                fallback: peers,
            })
            .await;
        }
        Ok(other) => {
            let reply = Message::invalid_protocol(format!(
                "expected HANDSHAKE_RESPONSE, got {}",
                other.command()
            ));
            let _ = writer.send_line(&codec::encode(&reply)).await;
            ctx.registry.mark_failed(&remote);
            ctx.emit(PeerEvent::Closed {
                remote,
                fallback: vec![],
            })
            .await;
        }
        Err(error) => {
            let reply = Message::invalid_protocol(error.to_string());
            let _ = writer.send_line(&codec::encode(&reply)).await;
            ctx.registry.mark_failed(&remote);
            ctx.emit(PeerEvent::Closed {
                remote,
                fallback: vec![],
            })
            .await;
        }
    }
}

/// Drive an accepted connection: await the peer's handshake, admit or refuse.
pub async fn run_incoming(ctx: ConnectionContext, transport: Transport) {
    let peer_addr = transport.remote_addr();
    let (mut reader, mut writer) = transport.split();

    let line = match timeout(ctx.handshake_timeout, reader.recv_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(_) | Err(_) => {
            debug!(%peer_addr, "no handshake received");
            return;
        }
    };

    let remote = match codec::decode(&line) {
        Ok(Message::HandshakeRequest { host_port }) => host_port,
        Ok(other) => {
            let reply = Message::invalid_protocol(format!(
                "expected HANDSHAKE_REQUEST, got {}",
                other.command()
            ));
            let _ = writer.send_line(&codec::encode(&reply)).await;
            return;
        }
        Err(error) => {
            let reply = Message::invalid_protocol(error.to_string());
            let _ = writer.send_line(&codec::encode(&reply)).await;
            return;
        }
    };

    match ctx.registry.add_incoming(remote.clone()) {
        Ok(peer) => {
            let response = Message::HandshakeResponse {
                host_port: ctx.local.clone(),
            };
            if writer.send_line(&codec::encode(&response)).await.is_err() {
                ctx.registry.remove(&remote);
                return;
            }
            peer.activate();
            info!(%remote, "accepted peer");
            drive(ctx, peer, reader, writer).await;
        }
        Err(active) => {
            info!(%remote, active = active.len(), "refusing connection, limit reached");
            let refusal = Message::ConnectionRefused {
                message: "connection limit reached".to_string(),
                peers: active,
            };
            let _ = writer.send_line(&codec::encode(&refusal)).await;
        }
    }
}

/// The active-phase loops: one writer task draining the queue, the reader
/// loop in the calling task. Returns when the connection is down and the
/// registry has been told.
async fn drive(
    ctx: ConnectionContext,
    peer: Arc<Peer>,
    mut reader: TransportReader,
    mut writer: TransportWriter,
) {
    let remote = peer.remote().clone();
    ctx.emit(PeerEvent::Activated {
        remote: remote.clone(),
    })
    .await;

    let writer_peer = peer.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = writer_peer.next_outbound().await {
            trace!(remote = %writer_peer.remote(), command = message.command(), "sending");
            if writer
                .send_line(&codec::encode(&message))
                .await
                .is_err()
            {
                writer_peer.close();
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = peer.wait_closed() => break,
            received = timeout(ctx.idle_timeout, reader.recv_line()) => match received {
                Err(_) => {
                    warn!(%remote, "peer unreachable, no traffic within idle limit");
                    break;
                }
                Ok(Err(error)) => {
                    debug!(%remote, %error, "transport failed");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(%remote, "peer closed the connection");
                    break;
                }
                Ok(Ok(Some(line))) => {
                    match codec::decode(&line) {
                        Ok(Message::InvalidProtocol { message }) => {
                            warn!(%remote, %message, "peer reported protocol violation");
                            break;
                        }
                        Ok(message) if message.is_handshake() => {
                            peer.enqueue(Message::invalid_protocol(format!(
                                "unexpected {} on an active connection",
                                message.command()
                            )));
                            break;
                        }
                        Ok(message) => {
                            trace!(%remote, command = message.command(), "received");
                            ctx.emit(PeerEvent::Message {
                                remote: remote.clone(),
                                message,
                            })
                            .await;
                        }
                        Err(error) => {
                            warn!(%remote, %error, "malformed message");
                            peer.enqueue(Message::invalid_protocol(error.to_string()));
                            break;
                        }
                    }
                }
            }
        }
    }

    // Terminal: drain whatever is queued (including a final
    // INVALID_PROTOCOL), then tell the world.
    peer.close();
    ctx.registry.remove(&remote);
    let _ = writer_task.await;
    ctx.emit(PeerEvent::Closed {
        remote,
        fallback: vec![],
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(HostPort::new("peer.example", 8111), false)
    }

    #[test]
    fn close_is_terminal() {
        let peer = peer();
        assert_eq!(peer.state(), PeerState::Waiting);
        peer.activate();
        assert_eq!(peer.state(), PeerState::Active);
        peer.close();
        assert_eq!(peer.state(), PeerState::Closed);
        // No resurrection.
        peer.activate();
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[test]
    fn enqueue_requires_active() {
        let peer = peer();
        let message = Message::invalid_protocol("x");
        assert!(!peer.enqueue(message.clone()));
        peer.activate();
        assert!(peer.enqueue(message.clone()));
        peer.close();
        assert!(!peer.enqueue(message));
    }

    #[tokio::test]
    async fn queued_messages_drain_after_close() {
        let peer = peer();
        peer.activate();
        let message = Message::invalid_protocol("pending");
        peer.enqueue(message.clone());
        peer.close();
        assert_eq!(peer.next_outbound().await, Some(message));
        assert_eq!(peer.next_outbound().await, None);
    }

    #[tokio::test]
    async fn wait_closed_wakes_on_close() {
        let peer = Arc::new(peer());
        peer.activate();
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.wait_closed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        peer.close();
        waiter.await.unwrap();
    }
}
