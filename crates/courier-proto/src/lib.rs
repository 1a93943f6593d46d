//! Wire format for the Courier message broker.
//!
//! Every frame on the byte stream is a 4-byte big-endian length followed by a
//! CBOR document. The document is an externally tagged enum, so the receiver
//! recovers the frame kind from the payload itself and never needs side-band
//! metadata.
//!
//! Payload bodies (message content, action content) are opaque CBOR values.
//! The broker only looks at routing fields: recipient, channel, action name
//! and correlation id.
//!
//! # Security
//!
//! The announced length is checked against a 16 MiB limit before any buffer
//! is allocated, so a peer cannot make us reserve arbitrary memory.
#![forbid(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::{Frame, FrameKind, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
pub use payloads::{
    Content,
    request::{ALL, Action, Message, Recipient, Reply, SERVER},
    session::{AuthCode, AuthResponse, Credentials, DEFAULT_GROUP},
};
