//! Client errors.

use courier_core::SendError;
use courier_proto::AuthCode;
use thiserror::Error;

/// Errors returned while constructing a [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused the credentials and retrying cannot help
    #[error("rejected by server: {0}")]
    Rejected(AuthCode),

    /// The client stopped before it could connect
    #[error("client stopped")]
    Stopped,

    /// A send failed
    #[error(transparent)]
    Send(#[from] SendError),
}
