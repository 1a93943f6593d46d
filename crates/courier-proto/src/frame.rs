//! Frame type and length-prefixed CBOR encoding.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────┐
//! │ length: u32 (BE)   │ CBOR document (length bytes) │
//! └────────────────────┴──────────────────────────────┘
//! ```
//!
//! The CBOR document is the externally tagged [`Frame`] enum, e.g.
//! `{"message": {...}}`. Decoding is split in two steps so a stream reader can
//! validate the prefix before allocating the body buffer.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    payloads::{
        request::{Action, Message, Reply},
        session::{AuthResponse, Credentials},
    },
};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum CBOR body size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// One discrete unit exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    /// Fire-and-forget or correlated message routed by recipient and channel
    Message(Message),
    /// Named action, always handled by the receiving engine's dispatch table
    Action(Action),
    /// Answer to a correlated message
    Reply(Reply),
    /// Client credentials, first frame of the handshake
    AuthRequest(Credentials),
    /// Server verdict, last frame of the handshake
    AuthResponse(AuthResponse),
}

/// Discriminator of a [`Frame`], used for logging and handshake checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// [`Frame::Message`]
    Message,
    /// [`Frame::Action`]
    Action,
    /// [`Frame::Reply`]
    Reply,
    /// [`Frame::AuthRequest`]
    AuthRequest,
    /// [`Frame::AuthResponse`]
    AuthResponse,
}

impl FrameKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Action => "action",
            Self::Reply => "reply",
            Self::AuthRequest => "auth_request",
            Self::AuthResponse => "auth_response",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Frame {
    /// Kind of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Message(_) => FrameKind::Message,
            Self::Action(_) => FrameKind::Action,
            Self::Reply(_) => FrameKind::Reply,
            Self::AuthRequest(_) => FrameKind::AuthRequest,
            Self::AuthResponse(_) => FrameKind::AuthResponse,
        }
    }

    /// Append the length prefix and CBOR body of this frame to `dst`.
    ///
    /// On error `dst` is left as it was.
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let start = dst.len();
        dst.extend_from_slice(&[0u8; LENGTH_PREFIX_SIZE]);

        if let Err(e) = ciborium::ser::into_writer(self, &mut *dst) {
            dst.truncate(start);
            return Err(ProtocolError::Encode(e.to_string()));
        }

        let size = dst.len() - start - LENGTH_PREFIX_SIZE;
        if size > MAX_PAYLOAD_SIZE {
            dst.truncate(start);
            return Err(ProtocolError::PayloadTooLarge { size, max: MAX_PAYLOAD_SIZE });
        }

        dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&(size as u32).to_be_bytes());
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Validate a length prefix and return the body size it announces.
    pub fn payload_len(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
        let size = u32::from_be_bytes(prefix) as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size, max: MAX_PAYLOAD_SIZE });
        }
        Ok(size)
    }

    /// Decode a CBOR body (without length prefix).
    pub fn decode_payload(body: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(body).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Decode one complete frame, prefix included.
    ///
    /// The buffer must contain exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Some((prefix, body)) = buf.split_first_chunk::<LENGTH_PREFIX_SIZE>() else {
            return Err(ProtocolError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                actual: buf.len(),
            });
        };

        let size = Self::payload_len(*prefix)?;
        if body.len() != size {
            return Err(ProtocolError::Truncated { expected: size, actual: body.len() });
        }

        Self::decode_payload(body)
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Action> for Frame {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}

impl From<Reply> for Frame {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use ciborium::Value;
    use proptest::prelude::*;

    use super::*;
    use crate::payloads::session::AuthCode;

    #[test]
    fn length_prefix_matches_body() {
        let frame = Frame::Action(Action::new("shutdown"));
        let bytes = frame.to_bytes().unwrap();

        let prefix: [u8; 4] = bytes[..4].try_into().unwrap();
        assert_eq!(Frame::payload_len(prefix).unwrap(), bytes.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn message_survives_encoding() {
        let mut message = Message::new("alice", "chat").with_content("hello");
        message.id = 0xdead_beef;
        message.sender = "bob".into();

        let decoded = Frame::decode(&Frame::Message(message.clone()).to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, Frame::Message(message));
    }

    #[test]
    fn auth_response_code_is_numeric_on_the_wire() {
        let frame = Frame::AuthResponse(AuthResponse { code: AuthCode::MaxSameClient });
        let bytes = frame.to_bytes().unwrap();

        let value: Value = ciborium::de::from_reader(&bytes[LENGTH_PREFIX_SIZE..]).unwrap();
        let Value::Map(outer) = value else { panic!("expected map") };
        let (tag, body) = &outer[0];
        assert_eq!(tag, &Value::Text("auth_response".into()));
        let Value::Map(fields) = body else { panic!("expected body map") };
        assert_eq!(fields[0].1, Value::Integer(4.into()));
    }

    #[test]
    fn oversized_prefix_is_rejected_before_allocation() {
        let prefix = (MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes();
        assert!(matches!(Frame::payload_len(prefix), Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(Frame::decode(&[0, 0]), Err(ProtocolError::Truncated { .. })));

        let mut bytes = Frame::Action(Action::new("x")).to_bytes().unwrap();
        bytes.pop();
        assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn unknown_variant_fails_to_decode() {
        let mut body = Vec::new();
        ciborium::ser::into_writer(&Value::Map(vec![(Value::Text("ping".into()), Value::Null)]), &mut body)
            .unwrap();
        assert!(matches!(Frame::decode_payload(&body), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn encode_appends_to_existing_buffer() {
        let mut buf = vec![0xaa];
        Frame::Action(Action::new("a")).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0xaa);
        assert!(Frame::decode(&buf[1..]).is_ok());
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Frame::decode(&bytes);
            let _ = Frame::decode_payload(&bytes);
        }

        #[test]
        fn routing_fields_survive_encoding(
            id in any::<u64>(),
            recipient in "[a-z]{1,12}",
            channel in "\\PC{0,24}",
            text in "\\PC{0,64}",
        ) {
            let mut reply = Reply::new(recipient, channel).with_content(text);
            reply.id = id;
            let decoded = Frame::decode(&Frame::Reply(reply.clone()).to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, Frame::Reply(reply));
        }
    }
}
