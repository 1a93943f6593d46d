//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Announced or produced payload exceeds [`crate::MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Buffer is shorter (or longer) than the length prefix announces.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the length prefix
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// CBOR serialization failed.
    #[error("frame encoding failed: {0}")]
    Encode(String),

    /// CBOR body is not a valid frame.
    #[error("frame decoding failed: {0}")]
    Decode(String),

    /// Content could not be converted to or from the requested type.
    #[error("content conversion failed: {0}")]
    Content(String),
}
