//! Server errors.

use std::io;

use courier_core::SendError;
use thiserror::Error;

/// Errors returned by [`crate::Server`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting failed
    #[error("listener error: {0}")]
    Io(#[from] io::Error),

    /// The server was closed
    #[error("server closed")]
    Closed,

    /// A send could not be completed
    #[error(transparent)]
    Send(#[from] SendError),
}
