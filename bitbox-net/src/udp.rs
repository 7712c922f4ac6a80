//! The unreliable datagram transport.
//!
//! Each line travels in a JSON-framed datagram `{seq, payload}`; the
//! receiving side answers `{seq, ack:true}` immediately, even for
//! duplicates. A sender retransmits with exponential backoff until its seq
//! is acknowledged, and gives up after the configured number of retries, at
//! which point the peer connection above it is torn down. One socket serves
//! every peer; inbound traffic is demultiplexed by source address and
//! duplicate seqs are absorbed before delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::errors::{NetError, Result};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Per-peer seqs remembered for duplicate suppression.
const DEDUP_WINDOW: usize = 1024;
/// Lines buffered per peer before the demux task starts dropping datagrams.
const ROUTE_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Datagram {
    seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    ack: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpConfig {
    /// Initial wait for an acknowledgement; doubles per attempt.
    pub timeout: Duration,
    /// Retransmissions after the first send.
    pub retries: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            retries: 3,
        }
    }
}

struct Route {
    line_tx: mpsc::Sender<String>,
    acked_tx: watch::Sender<u64>,
    seen: HashSet<u64>,
    order: VecDeque<u64>,
}

impl Route {
    /// Record a seq; false if it was already seen.
    fn observe(&mut self, seq: u64) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    routes: Arc<Mutex<HashMap<SocketAddr, Route>>>,
    config: UdpConfig,
}

/// Stream of transports for peers first heard from on the shared socket.
pub struct UdpIncoming {
    rx: mpsc::Receiver<(SocketAddr, Transport)>,
}

impl UdpIncoming {
    pub async fn accept(&mut self) -> Option<(SocketAddr, Transport)> {
        self.rx.recv().await
    }
}

impl UdpEndpoint {
    /// Bind the shared socket and start the demultiplexer.
    pub async fn bind(addr: SocketAddr, config: UdpConfig) -> Result<(Self, UdpIncoming)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        let endpoint = Self {
            socket: socket.clone(),
            routes: routes.clone(),
            config,
        };
        tokio::spawn(demux(socket, routes, incoming_tx, config));
        Ok((endpoint, UdpIncoming { rx: incoming_rx }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Open a transport towards a known remote address.
    pub fn connect(&self, remote: SocketAddr) -> Transport {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        let (transport, route) = build_route(&self.socket, remote, self.config);
        routes.insert(remote, route);
        transport
    }
}

fn build_route(
    socket: &Arc<UdpSocket>,
    remote: SocketAddr,
    config: UdpConfig,
) -> (Transport, Route) {
    let (line_tx, line_rx) = mpsc::channel(ROUTE_BUFFER);
    let (acked_tx, acked_rx) = watch::channel(0u64);
    let transport = Transport {
        reader: TransportReader::Udp(UdpReader { rx: line_rx }),
        writer: TransportWriter::Udp(UdpWriter {
            socket: socket.clone(),
            remote,
            next_seq: 1,
            acked: acked_rx,
            config,
        }),
        remote_addr: remote,
    };
    let route = Route {
        line_tx,
        acked_tx,
        seen: HashSet::new(),
        order: VecDeque::new(),
    };
    (transport, route)
}

async fn demux(
    socket: Arc<UdpSocket>,
    routes: Arc<Mutex<HashMap<SocketAddr, Route>>>,
    incoming_tx: mpsc::Sender<(SocketAddr, Transport)>,
    config: UdpConfig,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "datagram socket closed");
                return;
            }
        };
        let datagram: Datagram = match serde_json::from_slice(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(error) => {
                warn!(%addr, %error, "dropping unparseable datagram");
                continue;
            }
        };

        if datagram.ack {
            let routes = routes.lock().expect("routes lock poisoned");
            if let Some(route) = routes.get(&addr) {
                route
                    .acked_tx
                    .send_modify(|acked| *acked = (*acked).max(datagram.seq));
            }
            continue;
        }
        let payload = match datagram.payload {
            Some(payload) => payload,
            None => continue,
        };

        // Decide under the lock, deliver after releasing it.
        let (line_tx, fresh, new_transport) = {
            let mut routes = routes.lock().expect("routes lock poisoned");
            match routes.get_mut(&addr) {
                Some(route) => {
                    let fresh = route.observe(datagram.seq);
                    (route.line_tx.clone(), fresh, None)
                }
                None => {
                    let (transport, mut route) = build_route(&socket, addr, config);
                    route.observe(datagram.seq);
                    let line_tx = route.line_tx.clone();
                    routes.insert(addr, route);
                    (line_tx, true, Some(transport))
                }
            }
        };

        // Always acknowledge, duplicates included; the original ack may have
        // been lost.
        let ack = Datagram {
            seq: datagram.seq,
            payload: None,
            ack: true,
        };
        let frame = serde_json::to_string(&ack).expect("ack serialization is infallible");
        if let Err(error) = socket.send_to(frame.as_bytes(), addr).await {
            warn!(%addr, %error, "could not send ack");
        }

        if let Some(transport) = new_transport {
            debug!(%addr, "new datagram peer");
            if incoming_tx.try_send((addr, transport)).is_err() {
                // Nobody accepting: forget the route again.
                routes.lock().expect("routes lock poisoned").remove(&addr);
                continue;
            }
        }
        if fresh {
            if line_tx.try_send(payload).is_err() {
                trace!(%addr, "route buffer full, dropping datagram");
            }
        } else {
            trace!(%addr, seq = datagram.seq, "duplicate datagram suppressed");
        }
    }
}

pub struct UdpReader {
    rx: mpsc::Receiver<String>,
}

impl UdpReader {
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

pub struct UdpWriter {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    next_seq: u64,
    acked: watch::Receiver<u64>,
    config: UdpConfig,
}

impl UdpWriter {
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = serde_json::to_string(&Datagram {
            seq,
            payload: Some(line.to_string()),
            ack: false,
        })
        .expect("datagram serialization is infallible");

        let mut wait = self.config.timeout;
        let mut attempts = 0u32;
        loop {
            self.socket.send_to(frame.as_bytes(), self.remote).await?;
            attempts += 1;
            match tokio::time::timeout(wait, self.acked.wait_for(|acked| *acked >= seq)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(_)) => return Err(NetError::ConnectionClosed),
                Err(_) if attempts <= self.config.retries => {
                    trace!(remote = %self.remote, seq, attempts, "retransmitting");
                    wait *= 2;
                }
                Err(_) => return Err(NetError::RetryExhausted { attempts }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> UdpConfig {
        UdpConfig {
            timeout: Duration::from_millis(50),
            retries: 2,
        }
    }

    #[tokio::test]
    async fn lines_round_trip_with_acks() {
        let (a, _a_in) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        let (b, mut b_in) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();

        let (mut a_reader, mut a_writer) = a.connect(b.local_addr().unwrap()).split();
        a_writer.send_line("hello from a").await.unwrap();

        let (_, transport) = b_in.accept().await.unwrap();
        let (mut b_reader, mut b_writer) = transport.split();
        assert_eq!(b_reader.recv_line().await.unwrap().unwrap(), "hello from a");

        b_writer.send_line("hello from b").await.unwrap();
        assert_eq!(a_reader.recv_line().await.unwrap().unwrap(), "hello from b");
    }

    #[tokio::test]
    async fn unacknowledged_send_exhausts_retries() {
        let (a, _a_in) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        // A bare socket that never acknowledges anything.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (_, mut writer) = a.connect(silent.local_addr().unwrap()).split();
        let err = writer.send_line("anyone there").await.unwrap_err();
        match err {
            NetError::RetryExhausted { attempts } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_seqs_are_delivered_once() {
        let (endpoint, mut incoming) =
            UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), test_config())
                .await
                .unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = endpoint.local_addr().unwrap();

        let frame = r#"{"seq":1,"payload":"once"}"#;
        raw.send_to(frame.as_bytes(), target).await.unwrap();
        raw.send_to(frame.as_bytes(), target).await.unwrap();

        // Both transmissions are acknowledged.
        let mut buf = [0u8; 1024];
        for _ in 0..2 {
            let (len, _) = raw.recv_from(&mut buf).await.unwrap();
            let ack: Datagram = serde_json::from_slice(&buf[..len]).unwrap();
            assert!(ack.ack);
            assert_eq!(ack.seq, 1);
        }

        // But the payload arrives exactly once.
        let (_, transport) = incoming.accept().await.unwrap();
        let (mut reader, _) = transport.split();
        assert_eq!(reader.recv_line().await.unwrap().unwrap(), "once");
        let second = tokio::time::timeout(Duration::from_millis(100), reader.recv_line()).await;
        assert!(second.is_err(), "duplicate should not be delivered");
    }
}
