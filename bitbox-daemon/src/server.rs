//! The server root: wires the model, detector, engine, transports, registry,
//! and control channel together and drives the shared event loop.
//!
//! One loop owns everything that reacts to time or to peers: the periodic
//! scan-and-announce cycle, routed peer messages, dial requests from the
//! control channel, connection-refused fallback, and configuration reloads.
//! Shutdown closes every peer, cancels in-flight loaders, and returns.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bitbox_fs::{ChangeDetector, FileTreeModel};
use bitbox_net::{
    run_incoming, run_outgoing, tcp, ConnectionContext, PeerEvent, PeerRegistry, UdpConfig,
    UdpEndpoint,
};
use bitbox_proto::HostPort;
use bitbox_sync::SyncEngine;

use crate::config::{Config, TransportMode};
use crate::control::{ControlChannel, DialCommand};
use crate::errors::Result;

pub struct Daemon {
    config: watch::Receiver<Config>,
    share: PathBuf,
}

#[derive(Clone)]
enum DialTransport {
    Tcp,
    Udp(Arc<UdpEndpoint>),
}

/// Dials peers over whichever transport the daemon was started with.
#[derive(Clone)]
struct Dialer {
    transport: DialTransport,
    registry: Arc<PeerRegistry>,
    events: mpsc::Sender<PeerEvent>,
    config: watch::Receiver<Config>,
}

impl Dialer {
    fn context(&self) -> ConnectionContext {
        connection_context(&self.config.borrow(), &self.registry, &self.events)
    }

    /// Start an outbound connection attempt. True when the transport came up
    /// and the handshake is under way; activation is reported later as a
    /// peer event.
    async fn dial(&self, target: &HostPort) -> bool {
        if self.registry.contains(target) {
            return true;
        }
        let addr = match resolve(target).await {
            Some(addr) => addr,
            None => {
                warn!(%target, "could not resolve peer address");
                self.registry.mark_failed(target);
                return false;
            }
        };
        let transport = match &self.transport {
            DialTransport::Tcp => match tcp::connect(addr).await {
                Ok(transport) => transport,
                Err(error) => {
                    debug!(%target, %error, "dial failed");
                    self.registry.mark_failed(target);
                    return false;
                }
            },
            DialTransport::Udp(endpoint) => endpoint.connect(addr),
        };
        info!(%target, "dialing peer");
        tokio::spawn(run_outgoing(self.context(), transport, target.clone()));
        true
    }
}

async fn resolve(target: &HostPort) -> Option<SocketAddr> {
    tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
}

fn connection_context(
    config: &Config,
    registry: &Arc<PeerRegistry>,
    events: &mpsc::Sender<PeerEvent>,
) -> ConnectionContext {
    ConnectionContext {
        registry: registry.clone(),
        events: events.clone(),
        local: config.host_port(),
        handshake_timeout: config.sync_interval,
        idle_timeout: config.sync_interval * 2,
    }
}

impl Daemon {
    pub fn new(config: watch::Receiver<Config>, share: PathBuf) -> Self {
        Self { config, share }
    }

    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let startup = self.config.borrow().clone();
        info!(
            name = %startup.advertised_name,
            port = startup.port,
            mode = ?startup.mode,
            share = %self.share.display(),
            "starting bitbox daemon"
        );

        let model = Arc::new(FileTreeModel::new(&self.share)?);
        let detector = Arc::new(ChangeDetector::new(model.clone()));
        let registry = PeerRegistry::new(
            startup.host_port(),
            startup.maximum_incoming_connections,
        );
        let engine = Arc::new(SyncEngine::new(
            model.clone(),
            registry.clone(),
            startup.block_size,
            startup.sync_interval,
        ));

        let (event_tx, mut event_rx) = mpsc::channel::<PeerEvent>(256);
        let (dial_tx, mut dial_rx) = mpsc::channel::<DialCommand>(16);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Peer listener, by transport mode. The mode is never re-bound.
        let dial_transport = match startup.mode {
            TransportMode::Tcp => {
                let listener =
                    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], startup.port))).await?;
                info!(port = startup.port, "TCP peer transport listening");
                let registry_accept = registry.clone();
                let events_accept = event_tx.clone();
                let config_accept = self.config.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, addr)) => {
                                debug!(%addr, "inbound peer connection");
                                let ctx = connection_context(
                                    &config_accept.borrow(),
                                    &registry_accept,
                                    &events_accept,
                                );
                                match tcp::from_stream(stream) {
                                    Ok(transport) => {
                                        tokio::spawn(run_incoming(ctx, transport));
                                    }
                                    Err(error) => warn!(%addr, %error, "could not accept"),
                                }
                            }
                            Err(error) => {
                                warn!(%error, "peer accept failed");
                                return;
                            }
                        }
                    }
                }));
                DialTransport::Tcp
            }
            TransportMode::Udp => {
                let (endpoint, mut incoming) = UdpEndpoint::bind(
                    SocketAddr::from(([0, 0, 0, 0], startup.port)),
                    UdpConfig {
                        timeout: startup.udp_timeout,
                        retries: startup.udp_retries,
                    },
                )
                .await?;
                info!(port = startup.port, "UDP peer transport listening");
                let endpoint = Arc::new(endpoint);
                let registry_accept = registry.clone();
                let events_accept = event_tx.clone();
                let config_accept = self.config.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some((addr, transport)) = incoming.accept().await {
                        debug!(%addr, "inbound datagram peer");
                        let ctx = connection_context(
                            &config_accept.borrow(),
                            &registry_accept,
                            &events_accept,
                        );
                        tokio::spawn(run_incoming(ctx, transport));
                    }
                }));
                DialTransport::Udp(endpoint)
            }
        };

        let dialer = Dialer {
            transport: dial_transport,
            registry: registry.clone(),
            events: event_tx.clone(),
            config: self.config.clone(),
        };

        // Operator control channel.
        let control_listener =
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], startup.client_port))).await?;
        info!(port = startup.client_port, "client channel listening");
        let control = ControlChannel::new(registry.clone(), self.config.clone(), dial_tx.clone());
        tasks.push(tokio::spawn(control.run(control_listener)));

        // Dial the configured peers.
        for peer in &startup.peers {
            dialer.dial(peer).await;
        }

        // Dials awaiting an activation/closure verdict, for control replies.
        let mut pending_dials: HashMap<HostPort, Vec<oneshot::Sender<bool>>> = HashMap::new();
        // Alternates offered by CONNECTION_REFUSED, tried in order until one
        // activates or the list runs dry.
        let mut fallback_queue: VecDeque<HostPort> = VecDeque::new();
        let mut fallback_inflight: Option<HostPort> = None;

        let mut config_rx = self.config.clone();
        let mut next_scan = Instant::now();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }

                _ = tokio::time::sleep_until(next_scan.into()) => {
                    let scan_detector = detector.clone();
                    let scanned = tokio::task::spawn_blocking(move || {
                        let events = scan_detector.scan();
                        let announce = scan_detector.announce();
                        (events, announce)
                    })
                    .await;
                    match scanned {
                        Ok((Ok(events), announce)) => {
                            for event in &events {
                                engine.broadcast_event(event);
                            }
                            // The full-tree announce doubles as keep-alive
                            // traffic; the outbound queues collapse repeats.
                            for event in &announce {
                                engine.broadcast_event(event);
                            }
                        }
                        Ok((Err(error), _)) => warn!(%error, "scan failed"),
                        Err(error) => warn!(%error, "scan task failed"),
                    }
                    engine.sweep_deadlines();
                    next_scan = Instant::now() + config_rx.borrow().sync_interval;
                }

                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        PeerEvent::Activated { remote } => {
                            info!(%remote, "peer active");
                            for sender in pending_dials.remove(&remote).unwrap_or_default() {
                                let _ = sender.send(true);
                            }
                            if fallback_inflight.as_ref() == Some(&remote) {
                                // The fallback search found a home.
                                fallback_inflight = None;
                                fallback_queue.clear();
                            }
                            // Bring the new peer up to date right away.
                            for announce in detector.announce() {
                                engine.send_event_to(&remote, &announce);
                            }
                        }
                        PeerEvent::Message { remote, message } => {
                            engine.handle_message(&remote, message);
                        }
                        PeerEvent::Closed { remote, fallback } => {
                            debug!(%remote, "peer connection ended");
                            for sender in pending_dials.remove(&remote).unwrap_or_default() {
                                let _ = sender.send(false);
                            }
                            let searching = fallback_inflight.as_ref() == Some(&remote);
                            if searching {
                                fallback_inflight = None;
                            }
                            if !fallback.is_empty() {
                                let candidates = registry.fallback_candidates(&fallback);
                                info!(%remote, offered = fallback.len(), usable = candidates.len(),
                                      "trying alternate peers");
                                fallback_queue.extend(candidates);
                            }
                            if searching || !fallback.is_empty() {
                                while let Some(next) = fallback_queue.pop_front() {
                                    if dialer.dial(&next).await {
                                        fallback_inflight = Some(next);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }

                command = dial_rx.recv() => {
                    let Some(DialCommand { target, reply }) = command else { break };
                    if registry.contains(&target) {
                        let _ = reply.send(true);
                    } else if dialer.dial(&target).await {
                        pending_dials.entry(target).or_default().push(reply);
                    } else {
                        let _ = reply.send(false);
                    }
                }

                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = config_rx.borrow().clone();
                    registry.set_max_incoming(config.maximum_incoming_connections);
                    engine.set_block_size(config.block_size);
                    info!("configuration refreshed");
                }
            }
        }

        // Orderly exit: no further I/O on peers, loaders release their
        // sidecars.
        registry.close_all();
        engine.cancel_all();
        for task in tasks {
            task.abort();
        }
        info!("daemon stopped");
        Ok(())
    }
}
