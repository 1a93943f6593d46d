//! Frame payload types.
//!
//! - [`request`]: steady-state frames (message, action, reply)
//! - [`session`]: handshake frames (credentials, auth response)

use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

pub mod request;
pub mod session;

/// Opaque application content carried by messages, actions and replies.
///
/// Any CBOR value. The broker never inspects it.
pub type Content = ciborium::Value;

/// Serialize any value into [`Content`].
pub fn to_content<T: Serialize + ?Sized>(value: &T) -> Result<Content> {
    Content::serialized(value).map_err(|e| ProtocolError::Content(e.to_string()))
}

/// Deserialize [`Content`] into a concrete type.
pub fn from_content<T: DeserializeOwned>(content: &Content) -> Result<T> {
    content.deserialized().map_err(|e| ProtocolError::Content(e.to_string()))
}
