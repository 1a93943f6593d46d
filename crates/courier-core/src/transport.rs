//! Transport abstraction for stream-oriented connections.
//!
//! Production uses Tokio TCP, tests use Turmoil (simulated TCP). Framing and
//! every protocol rule live above this layer in [`crate::Connection`], so a
//! simulated stream exercises exactly the same code as a real socket.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Accepts inbound streams.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Bidirectional byte stream of one accepted peer.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound stream.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens outbound streams.
///
/// Called again on every reconnect attempt, so implementations must be
/// reusable.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Bidirectional byte stream to the server.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a stream to `addr` (`host:port`).
    async fn connect(&self, addr: &str) -> io::Result<Self::Stream>;
}

/// TCP listener with Nagle disabled on accepted sockets.
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

impl TcpListener {
    /// Bind to `addr` (`host:port`, port 0 for an ephemeral port).
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn connect(&self, addr: &str) -> io::Result<Self::Stream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
