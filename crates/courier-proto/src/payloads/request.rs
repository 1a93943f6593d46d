//! Steady-state payloads: messages, actions and replies.
//!
//! A [`Message`] with a non-zero `id` asks for a [`Reply`] carrying the same
//! id. The id is chosen at random by the sender; zero means no reply is
//! expected and any handler-side `reply` is a no-op.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Content, from_content, to_content};
use crate::errors::Result;

/// Recipient name addressing the server's own dispatch table.
pub const SERVER: &str = "server";

/// Recipient name addressing every connected client.
pub const ALL: &str = "all";

/// Parsed form of a recipient field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient<'a> {
    /// The server itself
    Server,
    /// Broadcast
    All,
    /// Every connection bound to this logical name
    Named(&'a str),
}

impl<'a> Recipient<'a> {
    /// Interpret a recipient field. Reserved names match case-insensitively.
    pub fn parse(raw: &'a str) -> Self {
        if raw.eq_ignore_ascii_case(SERVER) {
            Self::Server
        } else if raw.eq_ignore_ascii_case(ALL) {
            Self::All
        } else {
            Self::Named(raw)
        }
    }

    /// Whether `name` is reserved and cannot be used as a session name.
    pub fn is_reserved(name: &str) -> bool {
        !matches!(Recipient::parse(name), Recipient::Named(_))
    }
}

/// Message routed by recipient and dispatched by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id, 0 when no reply is requested
    pub id: u64,
    /// `"server"`, `"all"` or a logical session name
    pub recipient: String,
    /// Stamped by the server from the authenticated session
    pub sender: String,
    /// Channel used to select handlers
    pub channel: String,
    /// Opaque payload
    pub content: Content,
}

impl Message {
    /// Empty message for `recipient` on `channel`.
    pub fn new(recipient: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: 0,
            recipient: recipient.into(),
            sender: String::new(),
            channel: channel.into(),
            content: Content::Null,
        }
    }

    /// Message for the server's own handlers.
    pub fn to_server(channel: impl Into<String>) -> Self {
        Self::new(SERVER, channel)
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = content.into();
        self
    }

    /// Serialize `value` as the content.
    pub fn with_serialized<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.content = to_content(value)?;
        Ok(self)
    }

    /// Deserialize the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        from_content(&self.content)
    }

    /// Parsed recipient.
    pub fn route(&self) -> Recipient<'_> {
        Recipient::parse(&self.recipient)
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        self.id != 0
    }
}

/// Answer to a correlated [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id copied from the message
    pub id: u64,
    /// Original sender of the message
    pub recipient: String,
    /// Stamped by the server from the authenticated session
    pub sender: String,
    /// Channel copied from the message
    pub channel: String,
    /// Opaque payload
    pub content: Content,
}

impl Reply {
    /// Uncorrelated reply for `recipient` on `channel`.
    pub fn new(recipient: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: 0,
            recipient: recipient.into(),
            sender: String::new(),
            channel: channel.into(),
            content: Content::Null,
        }
    }

    /// Reply addressed back to the sender of `message`, with its id and channel.
    pub fn answering(message: &Message, content: impl Into<Content>) -> Self {
        Self {
            id: message.id,
            recipient: message.sender.clone(),
            sender: String::new(),
            channel: message.channel.clone(),
            content: content.into(),
        }
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = content.into();
        self
    }

    /// Deserialize the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        from_content(&self.content)
    }

    /// Parsed recipient.
    pub fn route(&self) -> Recipient<'_> {
        Recipient::parse(&self.recipient)
    }
}

/// Named action. Always handled by the receiving side's dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action name used to select handlers
    pub name: String,
    /// Opaque payload
    pub content: Content,
}

impl Action {
    /// Action without content.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), content: Content::Null }
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = content.into();
        self
    }

    /// Serialize `value` as the content.
    pub fn with_serialized<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.content = to_content(value)?;
        Ok(self)
    }

    /// Deserialize the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        from_content(&self.content)
    }
}
