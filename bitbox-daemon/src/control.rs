//! The authenticated operator control channel.
//!
//! One TCP listener on `clientPort`. A session starts unauthenticated and
//! must open with AUTH_REQUEST; on a known identity the daemon wraps a fresh
//! AES session key under the registered public key and answers in clear.
//! Every exchange after that — in both directions — travels inside the
//! encrypted `{payload}` envelope. A failed authentication or an undecodable
//! payload ends the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use bitbox_crypto::{
    decrypt_message, encrypt_message, parse_authorized_keys, wrap_session_key, SessionKey,
};
use bitbox_net::PeerRegistry;
use bitbox_proto::control::{ControlRequest, ControlResponse, Payload};
use bitbox_proto::HostPort;

use crate::config::Config;

/// Ask the server loop to dial a peer; the reply says whether a connection
/// was established.
#[derive(Debug)]
pub struct DialCommand {
    pub target: HostPort,
    pub reply: oneshot::Sender<bool>,
}

const DIAL_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ControlChannel {
    registry: Arc<PeerRegistry>,
    config: watch::Receiver<Config>,
    dialer: mpsc::Sender<DialCommand>,
}

impl ControlChannel {
    pub fn new(
        registry: Arc<PeerRegistry>,
        config: watch::Receiver<Config>,
        dialer: mpsc::Sender<DialCommand>,
    ) -> Self {
        Self {
            registry,
            config,
            dialer,
        }
    }

    /// Accept loop. Sessions are served one at a time, as the legacy server
    /// does; an operator session is short-lived.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!(%addr, "client connection");
                    if let Err(error) = self.serve(socket).await {
                        debug!(%addr, %error, "client session ended with error");
                    }
                }
                Err(error) => {
                    warn!(%error, "client accept failed");
                    return;
                }
            }
        }
    }

    async fn serve(&self, socket: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut session: Option<SessionKey> = None;

        while let Some(line) = lines.next_line().await? {
            let (response_line, close_after) = match session.take() {
                None => {
                    let (response, key) = self.authenticate(&line);
                    let text = serde_json::to_string(&response)
                        .expect("response serialization is infallible");
                    let failed = key.is_none();
                    session = key;
                    (text, failed)
                }
                Some(key) => {
                    let exchanged = self.exchange(&key, &line).await;
                    session = Some(key);
                    match exchanged {
                        Some(text) => (text, false),
                        // Undecodable traffic on an authenticated session:
                        // nothing sensible can be answered, drop the session.
                        None => break,
                    }
                }
            };

            write_half.write_all(response_line.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            write_half.flush().await?;
            if close_after {
                break;
            }
        }
        Ok(())
    }

    /// Handle the opening message of a session. Returns the clear-text
    /// response and, on success, the established session key.
    fn authenticate(&self, line: &str) -> (ControlResponse, Option<SessionKey>) {
        let identity = match serde_json::from_str::<ControlRequest>(line) {
            Ok(ControlRequest::Auth { identity }) => identity,
            Ok(other) => {
                warn!(?other, "command before authentication");
                return (
                    ControlResponse::Auth {
                        status: false,
                        message: "authentication required".to_string(),
                        aes128: None,
                    },
                    None,
                );
            }
            Err(error) => {
                warn!(%error, "malformed client message");
                return (
                    ControlResponse::Auth {
                        status: false,
                        message: "malformed request".to_string(),
                        aes128: None,
                    },
                    None,
                );
            }
        };

        let keys = parse_authorized_keys(&self.config.borrow().authorized_keys);
        // Several keys may share an identity; the first match wins.
        let Some(authorized) = keys.iter().find(|key| key.ident == identity) else {
            info!(%identity, "rejected unknown identity");
            return (
                ControlResponse::Auth {
                    status: false,
                    message: "public key not found".to_string(),
                    aes128: None,
                },
                None,
            );
        };

        let session = SessionKey::generate();
        match wrap_session_key(&session, &authorized.key) {
            Ok(wrapped) => {
                info!(%identity, "client authenticated");
                (
                    ControlResponse::Auth {
                        status: true,
                        message: "public key found".to_string(),
                        aes128: Some(wrapped),
                    },
                    Some(session),
                )
            }
            Err(error) => {
                warn!(%identity, %error, "session key wrap failed");
                (
                    ControlResponse::Auth {
                        status: false,
                        message: "error generating key".to_string(),
                        aes128: None,
                    },
                    None,
                )
            }
        }
    }

    /// Decrypt one request, dispatch it, encrypt the response. `None` ends
    /// the session.
    async fn exchange(&self, key: &SessionKey, line: &str) -> Option<String> {
        let envelope: Payload = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "expected encrypted payload");
                return None;
            }
        };
        let plain = match decrypt_message(key, &envelope.payload) {
            Ok(plain) => plain,
            Err(error) => {
                warn!(%error, "payload decryption failed");
                return None;
            }
        };
        let request: ControlRequest = match serde_json::from_str(&plain) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "undecodable client command");
                return None;
            }
        };

        let response = self.dispatch(request).await;
        let json =
            serde_json::to_string(&response).expect("response serialization is infallible");
        let envelope = Payload {
            payload: encrypt_message(key, &json),
        };
        Some(serde_json::to_string(&envelope).expect("envelope serialization is infallible"))
    }

    async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::ListPeers => ControlResponse::ListPeers {
                peers: self.registry.get_active(),
            },
            ControlRequest::ConnectPeer { host, port } => {
                let target = HostPort::new(host.clone(), port);
                let (status, message) = if self.registry.contains(&target) {
                    (true, "already connected to peer".to_string())
                } else {
                    match self.request_dial(target).await {
                        true => (true, "connected to peer".to_string()),
                        false => (false, "connection failed".to_string()),
                    }
                };
                ControlResponse::ConnectPeer {
                    host,
                    port,
                    status,
                    message,
                }
            }
            ControlRequest::DisconnectPeer { host, port } => {
                let target = HostPort::new(host.clone(), port);
                let (status, message) = match self.registry.remove(&target) {
                    Some(_) => (true, "disconnected from peer".to_string()),
                    None => (false, "connection not active".to_string()),
                };
                ControlResponse::DisconnectPeer {
                    host,
                    port,
                    status,
                    message,
                }
            }
            ControlRequest::Auth { .. } => {
                // Re-authentication inside a session is not a thing.
                ControlResponse::Auth {
                    status: false,
                    message: "already authenticated".to_string(),
                    aes128: None,
                }
            }
        }
    }

    async fn request_dial(&self, target: HostPort) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = DialCommand {
            target,
            reply: reply_tx,
        };
        if self.dialer.send(command).await.is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(DIAL_REPLY_TIMEOUT, reply_rx).await,
            Ok(Ok(true))
        )
    }
}
