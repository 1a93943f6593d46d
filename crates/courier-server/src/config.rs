//! Server configuration.

use std::{str::FromStr, time::Duration};

use courier_core::replies::DEFAULT_SWEEP_INTERVAL;

/// Which client-originated frames the server forwards to other clients.
///
/// Frames addressed to `"server"` are always delivered locally, and the
/// server's own sends are never gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RoutingLevel {
    /// No client-to-client forwarding
    Nothing = 0,
    /// Forward to a named recipient only
    #[default]
    Single = 1,
    /// Forward to named recipients and to `"all"`
    All = 3,
}

const DIRECT_BIT: u8 = 0b01;
const BROADCAST_BIT: u8 = 0b10;

impl RoutingLevel {
    /// Whether frames to a named recipient are forwarded.
    pub fn allows_direct(self) -> bool {
        self as u8 & DIRECT_BIT != 0
    }

    /// Whether frames to `"all"` are forwarded.
    pub fn allows_broadcast(self) -> bool {
        self as u8 & BROADCAST_BIT != 0
    }

    /// Level for a numeric value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Nothing),
            1 => Some(Self::Single),
            3 => Some(Self::All),
            _ => None,
        }
    }
}

/// Unrecognized routing level.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown routing level {0:?} (expected nothing, single, all, 0, 1 or 3)")]
pub struct ParseRoutingLevelError(String);

impl FromStr for RoutingLevel {
    type Err = ParseRoutingLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.parse::<u8>() {
            return Self::from_u8(value).ok_or_else(|| ParseRoutingLevelError(s.to_string()));
        }
        match s.to_ascii_lowercase().as_str() {
            "nothing" | "none" => Ok(Self::Nothing),
            "single" => Ok(Self::Single),
            "all" => Ok(Self::All),
            _ => Err(ParseRoutingLevelError(s.to_string())),
        }
    }
}

impl std::fmt::Display for RoutingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Nothing => "nothing",
            Self::Single => "single",
            Self::All => "all",
        })
    }
}

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Global cap on authenticated connections
    pub max_clients: usize,
    /// Cap on connections sharing one logical name
    pub max_same_client: usize,
    /// Client-to-client forwarding policy
    pub routing_level: RoutingLevel,
    /// Time allowed for the credential frame to arrive
    pub handshake_timeout: Duration,
    /// Period of the reply registry's expiry sweep
    pub reply_sweep_interval: Duration,
    /// Frames queued per session before a client that stops reading is
    /// closed
    pub outbound_capacity: usize,
    /// Report transport and protocol failures at `warn` instead of `debug`
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 50,
            max_same_client: 10,
            routing_level: RoutingLevel::default(),
            handshake_timeout: Duration::from_secs(3),
            reply_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            outbound_capacity: 256,
            debug: false,
        }
    }
}
