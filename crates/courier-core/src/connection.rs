//! Framed connection shared by one reader and many writers.
//!
//! # Locking
//!
//! The read half and the write half sit behind two distinct async mutexes.
//! A writer never waits for the reader and the reader never waits for a
//! writer. Every frame is encoded up front and written while holding the send
//! lock, so concurrent writers interleave at frame boundaries only.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ begin_handshake ┌────────────────┐  mark_open  ┌──────┐
//! │ Connecting │────────────────>│ Authenticating │────────────>│ Open │
//! └────────────┘                 └────────────────┘             └──────┘
//!        │                               │                          │
//!        │            close / I/O error  │                          │
//!        ↓                               ↓                          ↓
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │                        Closed (terminal)                        │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `close()` cancels a token that every blocked `recv` and `send` also waits
//! on, so closing interrupts the reader without touching its lock.
//!
//! A `send` dropped after part of its frame reached the transport closes the
//! connection. The peer would otherwise read the next frame from the middle
//! of the truncated one.

use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use courier_proto::{Frame, LENGTH_PREFIX_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, handshake not started
    Connecting,
    /// Credential frame in flight
    Authenticating,
    /// Handshake accepted; steady-state frames flow
    Open,
    /// Terminated; no further I/O
    Closed,
}

/// One live transport with send and receive locks.
pub struct Connection {
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: Mutex<ConnectionState>,
    closed: CancellationToken,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap a bidirectional stream. Starts in [`ConnectionState::Connecting`].
    pub fn new<S>(stream: S, peer_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer, peer_addr)
    }

    /// Build from separate halves.
    pub fn from_parts<R, W>(reader: R, writer: W, peer_addr: Option<SocketAddr>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: tokio::sync::Mutex::new(Box::new(reader)),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            state: Mutex::new(ConnectionState::Connecting),
            closed: CancellationToken::new(),
            peer_addr,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the handshake succeeded and the connection is still live.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Remote address, when the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// `Connecting` → `Authenticating`.
    pub fn begin_handshake(&self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Connecting, ConnectionState::Authenticating, "begin_handshake")
    }

    /// `Authenticating` → `Open`.
    pub fn mark_open(&self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Authenticating, ConnectionState::Open, "mark_open")
    }

    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        operation: &'static str,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ConnectionError::InvalidState { state: *state, operation });
        }
        *state = to;
        Ok(())
    }

    /// Move to `Closed` and interrupt any blocked read or write.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        self.closed.cancel();
        true
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close and shut down the write half so the peer observes EOF.
    pub async fn shutdown(&self) {
        let _ = self.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Write one frame under the send lock.
    ///
    /// A transport failure closes the connection, and so does dropping this
    /// future once the frame is partly written.
    pub async fn send(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let bytes = frame.to_bytes()?;

        let mut writer = self.writer.lock().await;
        let mut guard = PartialWrite { connection: self, torn: false };
        let written = tokio::select! {
            () = self.closed.cancelled() => return Err(ConnectionError::Closed),
            result = write_frame(&mut *writer, &bytes, &mut guard.torn) => result,
        };

        if let Err(e) = written {
            drop(guard);
            drop(writer);
            let _ = self.close();
            return Err(ConnectionError::Io(e));
        }
        guard.torn = false;
        Ok(())
    }

    /// Read the next frame under the receive lock.
    ///
    /// Resolves to [`ConnectionError::Closed`] as soon as the connection is
    /// closed locally or the peer hangs up between frames. A body that fails
    /// to decode yields a recoverable protocol error; every other failure
    /// closes the connection.
    pub async fn recv(&self) -> Result<Frame, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let result = tokio::select! {
            () = self.closed.cancelled() => Err(ConnectionError::Closed),
            result = read_frame(&mut *reader) => result,
        };

        if let Err(e) = &result {
            if !e.is_recoverable() {
                let _ = self.close();
            }
        }
        result
    }

    /// [`Self::recv`] bounded by `limit`. Used during the handshake.
    pub async fn recv_timeout(&self, limit: Duration) -> Result<Frame, ConnectionError> {
        match tokio::time::timeout(limit, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(limit)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Closes the connection on drop while `torn` is set.
struct PartialWrite<'a> {
    connection: &'a Connection,
    torn: bool,
}

impl Drop for PartialWrite<'_> {
    fn drop(&mut self) {
        if self.torn && self.connection.close() {
            tracing::debug!(peer = ?self.connection.peer_addr, "send abandoned mid-frame, connection closed");
        }
    }
}

/// Write `bytes` in full, setting `torn` while only a prefix has gone out.
async fn write_frame(writer: &mut BoxedWriter, bytes: &[u8], torn: &mut bool) -> std::io::Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let n = writer.write(&bytes[offset..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        offset += n;
        *torn = offset < bytes.len();
    }
    writer.flush().await
}

async fn read_frame(reader: &mut BoxedReader) -> Result<Frame, ConnectionError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
            _ => ConnectionError::Io(e),
        });
    }

    let size = Frame::payload_len(prefix)?;
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;

    Ok(Frame::decode_payload(&body)?)
}
