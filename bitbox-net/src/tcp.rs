//! The reliable stream transport: newline-framed JSON over TCP.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::errors::Result;
use crate::transport::{Transport, TransportReader, TransportWriter};

pub struct TcpReader {
    inner: BufReader<OwnedReadHalf>,
}

pub struct TcpWriter {
    inner: OwnedWriteHalf,
}

impl TcpReader {
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self.inner.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl TcpWriter {
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Wrap an accepted or connected stream.
pub fn from_stream(stream: TcpStream) -> Result<Transport> {
    let remote_addr = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    Ok(Transport {
        reader: TransportReader::Tcp(TcpReader {
            inner: BufReader::new(read_half),
        }),
        writer: TransportWriter::Tcp(TcpWriter { inner: write_half }),
        remote_addr,
    })
}

/// Dial a remote peer.
pub async fn connect(addr: SocketAddr) -> Result<Transport> {
    let stream = TcpStream::connect(addr).await?;
    from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn lines_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = from_stream(stream).unwrap().split();
            let line = reader.recv_line().await.unwrap().unwrap();
            writer.send_line(&format!("echo {}", line)).await.unwrap();
        });

        let (mut reader, mut writer) = connect(addr).await.unwrap().split();
        writer.send_line(r#"{"command":"X"}"#).await.unwrap();
        let reply = reader.recv_line().await.unwrap().unwrap();
        assert_eq!(reply, r#"echo {"command":"X"}"#);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_reports_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let (mut reader, _writer) = connect(addr).await.unwrap().split();
        assert!(reader.recv_line().await.unwrap().is_none());
        server.await.unwrap();
    }
}
