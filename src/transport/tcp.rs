//! TCP connector for direct-hosted SMB

use super::{Connector, FrameReader, FrameWriter, Link};
use crate::error::{Error, Result};
use crate::netbios::frame::{encode_session_message, FrameDecoder};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Opens NetBIOS-framed TCP connections, optionally from a fixed local address
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Wrap an already connected stream.
    pub fn link_from_stream(stream: TcpStream) -> Result<Link> {
        let local_addr = stream.local_addr().ok();
        let (read, write) = stream.into_split();
        Ok(Link {
            reader: Box::new(TcpFrameReader {
                stream: read,
                decoder: FrameDecoder::new(),
            }),
            writer: Box::new(TcpFrameWriter { stream: write }),
            local_addr,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, remote: SocketAddr, local: Option<IpAddr>) -> Result<Link> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = local {
            if ip.is_ipv4() != remote.is_ipv4() {
                return Err(Error::InvalidParameter(format!(
                    "local address {} and remote address {} are different families",
                    ip, remote
                )));
            }
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        let stream = socket.connect(remote).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!(remote = %remote, local = ?stream.local_addr().ok(), "TCP connection established");
        Self::link_from_stream(stream)
    }
}

struct TcpFrameReader {
    stream: OwnedReadHalf,
    decoder: FrameDecoder,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

struct TcpFrameWriter {
    stream: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        let message = encode_session_message(&frame)?;
        self.stream.write_all(&message).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
