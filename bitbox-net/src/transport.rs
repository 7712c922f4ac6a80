//! Transport-agnostic line framing.
//!
//! Both adapters carry newline-terminated JSON and expose the same
//! send/receive contract, so the peer connection logic never branches on the
//! transport in use.

use std::net::SocketAddr;

use crate::errors::Result;
use crate::{tcp, udp};

pub struct Transport {
    pub(crate) reader: TransportReader,
    pub(crate) writer: TransportWriter,
    pub(crate) remote_addr: SocketAddr,
}

impl Transport {
    /// The socket address of the remote end (not its advertised host:port).
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

pub enum TransportReader {
    Tcp(tcp::TcpReader),
    Udp(udp::UdpReader),
}

pub enum TransportWriter {
    Tcp(tcp::TcpWriter),
    Udp(udp::UdpWriter),
}

impl TransportReader {
    /// The next line, or `None` on an orderly end of stream.
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        match self {
            TransportReader::Tcp(reader) => reader.recv_line().await,
            TransportReader::Udp(reader) => reader.recv_line().await,
        }
    }
}

impl TransportWriter {
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        match self {
            TransportWriter::Tcp(writer) => writer.send_line(line).await,
            TransportWriter::Udp(writer) => writer.send_line(line).await,
        }
    }
}
