//! Error types shared by client and server.

use std::{io, time::Duration};

use courier_proto::ProtocolError;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors raised by a single [`crate::Connection`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection was closed locally or by the peer
    #[error("connection closed")]
    Closed,

    /// No frame arrived in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Outbound queue at capacity; the connection was closed
    #[error("outbound queue full ({0} frames pending)")]
    Overloaded(usize),

    /// Operation not valid in the current state
    #[error("invalid state {state:?} for {operation}")]
    InvalidState {
        /// State at the time of the call
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Frame could not be encoded or decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Whether the stream is still usable after this error.
    ///
    /// A frame whose body fails to decode was read in full, so the next frame
    /// starts on a clean boundary. Every other error leaves the connection
    /// unusable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Decode(_)))
    }
}

/// Errors returned by the public send operations.
#[derive(Debug, Error)]
pub enum SendError {
    /// The engine was closed
    #[error("engine closed")]
    Closed,

    /// No live connection and queueing is not possible
    #[error("not connected")]
    NotConnected,

    /// Pre-connect queue is at capacity
    #[error("send queue full ({0} frames pending)")]
    QueueFull(usize),

    /// Writing to the connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Report a recoverable failure.
///
/// Failures are expected in normal operation (peers disconnect, servers
/// restart), so they are only surfaced at `warn` when `debug` is enabled.
pub fn log_failure(debug: bool, context: &str, error: &dyn std::error::Error) {
    if debug {
        tracing::warn!(error = %error, "{context}");
    } else {
        tracing::debug!(error = %error, "{context}");
    }
}
