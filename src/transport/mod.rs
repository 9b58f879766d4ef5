//! Transport layer
//!
//! The physical link is abstracted behind [`Connector`], which hands out a
//! framed reader/writer pair per connection. [`SmbTransport`] owns one such
//! link, negotiates on it and multiplexes concurrent requests over it.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub mod connection;
pub mod mux;
pub mod pool;
pub mod tcp;

pub use connection::{SmbTransport, TransportState};
pub use pool::TransportPool;
pub use tcp::TcpConnector;

/// Remote endpoint: the name used in UNC paths plus the resolved address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub addr: SocketAddr,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            host: host.into(),
            addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.host, self.addr)
    }
}

/// Sending half of a framed link
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete SMB2 message
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Close the sending side
    async fn shutdown(&mut self) -> Result<()>;
}

/// Receiving half of a framed link
#[async_trait]
pub trait FrameReader: Send {
    /// Next complete SMB2 message, `None` once the peer closed the link
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// An open physical connection
pub struct Link {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub local_addr: Option<SocketAddr>,
}

/// Opens physical connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, remote: SocketAddr, local: Option<IpAddr>) -> Result<Link>;
}
