use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ProtoError;

/// A peer address as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtoError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ProtoError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtoError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Identifies one version of a file's content.
///
/// Two descriptors describe the same content iff their `md5` digests are
/// equal; `last_modified` only breaks ties when deciding which of two
/// versions is newer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Lowercase 32-hex MD5 digest of the file content.
    pub md5: String,
    /// Modification time, integer seconds since the epoch.
    pub last_modified: u64,
    pub file_size: u64,
}

impl FileDescriptor {
    pub fn new(md5: impl Into<String>, last_modified: u64, file_size: u64) -> Self {
        Self {
            md5: md5.into(),
            last_modified,
            file_size,
        }
    }

    /// Whether both descriptors name the same content.
    pub fn same_content(&self, other: &FileDescriptor) -> bool {
        self.md5 == other.md5
    }

    /// The "newer" decision: later `last_modified` wins; on a tie the
    /// lexicographically greater digest wins, which keeps two diverged
    /// replicas converging on the same version.
    pub fn newer_than(&self, other: &FileDescriptor) -> bool {
        self.last_modified > other.last_modified
            || (self.last_modified == other.last_modified && self.md5 > other.md5)
    }
}

/// The peer-channel message catalogue.
///
/// One variant per `command`; field names follow the legacy wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    HandshakeRequest {
        host_port: HostPort,
    },
    HandshakeResponse {
        host_port: HostPort,
    },
    ConnectionRefused {
        message: String,
        peers: Vec<HostPort>,
    },
    InvalidProtocol {
        message: String,
    },
    FileCreateRequest {
        path_name: String,
        file_descriptor: FileDescriptor,
    },
    FileCreateResponse {
        path_name: String,
        file_descriptor: FileDescriptor,
        status: bool,
        message: String,
    },
    FileModifyRequest {
        path_name: String,
        file_descriptor: FileDescriptor,
    },
    FileModifyResponse {
        path_name: String,
        file_descriptor: FileDescriptor,
        status: bool,
        message: String,
    },
    FileDeleteRequest {
        path_name: String,
        file_descriptor: FileDescriptor,
    },
    FileDeleteResponse {
        path_name: String,
        file_descriptor: FileDescriptor,
        status: bool,
        message: String,
    },
    FileBytesRequest {
        path_name: String,
        file_descriptor: FileDescriptor,
        position: u64,
        length: u64,
    },
    FileBytesResponse {
        path_name: String,
        file_descriptor: FileDescriptor,
        position: u64,
        length: u64,
        /// Base64 of the requested byte range; empty when `status` is false.
        content: String,
        status: bool,
        message: String,
    },
    DirectoryCreateRequest {
        path_name: String,
    },
    DirectoryCreateResponse {
        path_name: String,
        status: bool,
        message: String,
    },
    DirectoryDeleteRequest {
        path_name: String,
    },
    DirectoryDeleteResponse {
        path_name: String,
        status: bool,
        message: String,
    },
}

impl Message {
    /// The wire name of this message's command, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Message::HandshakeRequest { .. } => "HANDSHAKE_REQUEST",
            Message::HandshakeResponse { .. } => "HANDSHAKE_RESPONSE",
            Message::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            Message::InvalidProtocol { .. } => "INVALID_PROTOCOL",
            Message::FileCreateRequest { .. } => "FILE_CREATE_REQUEST",
            Message::FileCreateResponse { .. } => "FILE_CREATE_RESPONSE",
            Message::FileModifyRequest { .. } => "FILE_MODIFY_REQUEST",
            Message::FileModifyResponse { .. } => "FILE_MODIFY_RESPONSE",
            Message::FileDeleteRequest { .. } => "FILE_DELETE_REQUEST",
            Message::FileDeleteResponse { .. } => "FILE_DELETE_RESPONSE",
            Message::FileBytesRequest { .. } => "FILE_BYTES_REQUEST",
            Message::FileBytesResponse { .. } => "FILE_BYTES_RESPONSE",
            Message::DirectoryCreateRequest { .. } => "DIRECTORY_CREATE_REQUEST",
            Message::DirectoryCreateResponse { .. } => "DIRECTORY_CREATE_RESPONSE",
            Message::DirectoryDeleteRequest { .. } => "DIRECTORY_DELETE_REQUEST",
            Message::DirectoryDeleteResponse { .. } => "DIRECTORY_DELETE_RESPONSE",
        }
    }

    /// Whether this message is part of the handshake exchange.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::HandshakeRequest { .. }
                | Message::HandshakeResponse { .. }
                | Message::ConnectionRefused { .. }
        )
    }

    pub fn invalid_protocol(message: impl Into<String>) -> Self {
        Message::InvalidProtocol {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parses_and_displays() {
        let hp: HostPort = "example.org:8111".parse().unwrap();
        assert_eq!(hp, HostPort::new("example.org", 8111));
        assert_eq!(hp.to_string(), "example.org:8111");
    }

    #[test]
    fn host_port_rejects_garbage() {
        assert!("no-port".parse::<HostPort>().is_err());
        assert!(":8111".parse::<HostPort>().is_err());
        assert!("host:notaport".parse::<HostPort>().is_err());
    }

    #[test]
    fn newer_decision_prefers_last_modified_then_md5() {
        let older = FileDescriptor::new("aaaa", 1000, 5);
        let newer = FileDescriptor::new("bbbb", 2000, 5);
        assert!(newer.newer_than(&older));
        assert!(!older.newer_than(&newer));

        // Equal timestamps: lexicographically greater digest wins.
        let a = FileDescriptor::new("aaaa", 1000, 5);
        let b = FileDescriptor::new("bbbb", 1000, 5);
        assert!(b.newer_than(&a));
        assert!(!a.newer_than(&b));
    }

    #[test]
    fn command_tag_matches_wire_name() {
        let msg = Message::FileCreateRequest {
            path_name: "f".into(),
            file_descriptor: FileDescriptor::new("00", 0, 0),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"], "FILE_CREATE_REQUEST");
        assert_eq!(msg.command(), "FILE_CREATE_REQUEST");
    }
}
