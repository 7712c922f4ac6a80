use bitbox_proto::HostPort;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] bitbox_proto::ProtoError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("datagram unacknowledged after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("peer not found: {0}")]
    PeerNotFound(HostPort),

    #[error("connection limit reached")]
    CapacityExceeded,
}

pub type Result<T> = std::result::Result<T, NetError>;
