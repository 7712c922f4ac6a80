//! The operator control-channel catalogue.
//!
//! The control channel shares the newline-terminated JSON framing of the peer
//! channel but carries its own command set. After authentication every
//! request and response travels inside an encrypted [`Payload`] envelope.

use serde::{Deserialize, Serialize};

use crate::message::HostPort;

/// Requests a client may send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlRequest {
    #[serde(rename = "AUTH_REQUEST")]
    Auth { identity: String },

    #[serde(rename = "LIST_PEERS_REQUEST")]
    ListPeers,

    #[serde(rename = "CONNECT_PEER_REQUEST")]
    ConnectPeer { host: String, port: u16 },

    #[serde(rename = "DISCONNECT_PEER_REQUEST")]
    DisconnectPeer { host: String, port: u16 },
}

/// Responses the daemon sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlResponse {
    #[serde(rename = "AUTH_RESPONSE")]
    Auth {
        status: bool,
        message: String,
        /// The wrapped session key, present only on success.
        #[serde(rename = "AES128", skip_serializing_if = "Option::is_none")]
        aes128: Option<String>,
    },

    #[serde(rename = "LIST_PEERS_RESPONSE")]
    ListPeers { peers: Vec<HostPort> },

    #[serde(rename = "CONNECT_PEER_RESPONSE")]
    ConnectPeer {
        host: String,
        port: u16,
        status: bool,
        message: String,
    },

    #[serde(rename = "DISCONNECT_PEER_RESPONSE")]
    DisconnectPeer {
        host: String,
        port: u16,
        status: bool,
        message: String,
    },
}

/// The encrypted envelope used after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Base64 of the AES-encrypted plaintext line.
    pub payload: String,
}
