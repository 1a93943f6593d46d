//! Handshake payloads.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Group assigned when the client does not pick one.
pub const DEFAULT_GROUP: &str = "default";

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Client credentials sent as the first frame of a connection.
///
/// The token is derived from `name`, `group` and the shared private key (see
/// `courier_core::auth::TokenVerifier`); servers with a custom authenticator
/// may interpret it as a plain password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Logical session name
    pub name: String,
    /// Optional group, `"default"` when omitted
    #[serde(default = "default_group")]
    pub group: String,
    /// Token or password
    pub token: String,
}

impl Credentials {
    /// Credentials in the default group.
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self { name: name.into(), group: default_group(), token: token.into() }
    }

    /// Replace the group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Outcome of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum AuthCode {
    /// Session accepted
    Ok = 0,
    /// Credentials did not verify
    Invalid = 1,
    /// Name is reserved (`server`, `all`)
    Forbidden = 2,
    /// Server is at its global connection cap
    MaxGlobalClient = 3,
    /// Too many connections already share this name
    MaxSameClient = 4,
    /// Handshake frame was not a credential frame
    Malformed = 5,
    /// Server failed while handling the handshake
    InternalError = 6,
}

impl AuthCode {
    /// Whether the session was accepted.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Whether retrying with the same credentials cannot succeed.
    ///
    /// Capacity and internal errors may clear up on their own; a bad token or
    /// a reserved name will not.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Invalid | Self::Forbidden | Self::Malformed)
    }

    /// Upper-case protocol name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Invalid => "INVALID",
            Self::Forbidden => "FORBIDDEN",
            Self::MaxGlobalClient => "MAX_GLOBAL_CLIENT",
            Self::MaxSameClient => "MAX_SAME_CLIENT",
            Self::Malformed => "MALFORMED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for AuthCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server verdict on a credential frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Verdict
    pub code: AuthCode,
}
