//! Turmoil-backed transport.
//!
//! Simulated TCP streams implement Tokio's `AsyncRead`/`AsyncWrite`, so the
//! framed [`courier_core::Connection`] runs on them as on real sockets.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use courier_core::{Connector, Listener};
use turmoil::net::{TcpListener, TcpStream};

/// Listener on the simulated network.
pub struct SimListener {
    inner: TcpListener,
}

impl std::fmt::Debug for SimListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimListener").finish_non_exhaustive()
    }
}

impl SimListener {
    /// Bind inside the current simulated host.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        tracing::debug!(addr, "sim listener bound");
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for SimListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        self.inner.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Dials hosts on the simulated network by name (`"broker:7878"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SimConnector;

#[async_trait]
impl Connector for SimConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: &str) -> io::Result<Self::Stream> {
        TcpStream::connect(addr).await
    }
}
