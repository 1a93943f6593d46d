//! Courier core
//!
//! The pieces every Courier engine is built from, client or server alike.
//! Nothing in here knows which side of the connection it runs on: the server
//! and the client compose the same dispatch table and reply registry, and
//! both drive a [`connection::Connection`] with one reader and any number of
//! writers.
//!
//! # Components
//!
//! - [`auth`]: Credential verification (shared-key tokens, custom checks)
//! - [`replies`]: Reply correlation registry (TTL callbacks, exactly-once)
//! - [`dispatch`]: Channel and action handler tables
//! - [`connection`]: Framed connection with distinct send and receive locks
//! - [`transport`]: Listener and connector abstraction (TCP, simulation)
//! - [`error`]: Connection and send error types

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod replies;
pub mod transport;

pub use auth::{AllowAll, Authenticator, TokenVerifier};
pub use connection::{Connection, ConnectionState};
pub use dispatch::{ActionEvent, Dispatcher, MessageEvent, Peer};
pub use error::{ConnectionError, SendError};
pub use replies::{DEFAULT_REPLY_TIMEOUT, ReplyCallback, ReplyOutcome, ReplyRegistry};
pub use transport::{Connector, Listener, TcpConnector, TcpListener};

/// Lifecycle of a shared engine structure.
///
/// Checked at the top of every public operation; a `Closed` structure refuses
/// new work instead of panicking on torn-down state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting registrations and input
    Open,
    /// Torn down; terminal
    Closed,
}
