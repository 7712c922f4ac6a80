//! Shared helpers for the workspace integration tests.
#![allow(dead_code)]

use std::net::{TcpListener, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use bitbox_daemon::{Config, ConfigWatcher, Daemon, TransportMode};
use bitbox_proto::HostPort;

/// Grab an ephemeral TCP port. The listener is dropped, so there is a small
/// race window, but ephemeral ports are not reused eagerly.
pub fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A fast-cycling test configuration: one-second scans, four-byte blocks so
/// any real content takes several pulls.
pub fn test_config(port: u16, client_port: u16, peers: Vec<HostPort>, mode: TransportMode) -> Config {
    Config {
        advertised_name: "127.0.0.1".to_string(),
        port,
        peers,
        mode,
        block_size: 4,
        sync_interval: Duration::from_secs(1),
        maximum_incoming_connections: 10,
        udp_timeout: Duration::from_millis(200),
        udp_retries: 3,
        client_port,
        authorized_keys: String::new(),
    }
}

pub struct RunningDaemon {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RunningDaemon {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.handle.await;
    }
}

/// Start a daemon over a fixed config and wait until its client port
/// answers, which means the listeners are bound.
pub async fn spawn_daemon(config: Config, share: PathBuf) -> RunningDaemon {
    let client_port = config.client_port;
    let rx = ConfigWatcher::fixed(config);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let daemon = Daemon::new(rx, share);
        if let Err(error) = daemon
            .run(async {
                let _ = stop_rx.await;
            })
            .await
        {
            panic!("daemon failed: {}", error);
        }
    });

    assert!(
        wait_until(Duration::from_secs(10), || {
            std::net::TcpStream::connect(("127.0.0.1", client_port)).is_ok()
        })
        .await,
        "daemon did not come up on client port {}",
        client_port
    );
    RunningDaemon {
        stop: Some(stop_tx),
        handle,
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
