//! Courier broker server
//!
//! Accepts persistent connections, authenticates them, and routes messages,
//! actions and replies between clients and the server's own handlers.
//!
//! # Architecture
//!
//! One accept loop spawns one task per socket. Each task runs the handshake,
//! registers the session, then reads frames until the socket closes:
//!
//! ```text
//! Listener ─> handshake ─> SessionRegistry
//!                 │
//!                 └─> read loop ─┬─> Dispatcher (actions, "server" messages)
//!                                ├─> ReplyRegistry ("server" replies)
//!                                └─> forward to other sessions (routing level)
//! ```
//!
//! The sender field of every forwarded frame is overwritten with the name the
//! connection authenticated as.
//!
//! # Components
//!
//! - [`server`]: Listener and server-wide send API
//! - [`registry`]: Logical names to live connections
//! - [`session`]: Handle to one authenticated connection
//! - [`handshake`]: Credential checks and the `AuthResponse`
//! - [`router`]: Routing level decisions
//! - [`config`]: Tunables and routing levels

pub mod config;
pub mod error;
mod handler;
pub mod handshake;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use config::{RoutingLevel, ServerConfig};
pub use error::ServerError;
pub use registry::SessionRegistry;
pub use router::Route;
pub use server::Server;
pub use session::ClientConnection;
