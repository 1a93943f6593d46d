//! Courier client
//!
//! A long-lived session to a Courier server. The client connects,
//! authenticates, and reconnects on failure until it is closed or runs out of
//! retries. Sends issued while it is not connected are queued and flushed in
//! order on the next successful handshake.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_client::{Client, ClientConfig};
//! use courier_core::TokenVerifier;
//! use courier_proto::Message;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = TokenVerifier::new("shared-key").credentials("alice", "default");
//! let client = Client::connect("127.0.0.1:7878", credentials, ClientConfig::default()).await?;
//!
//! client.on_message("chat", |event| async move {
//!     let _ = event.reply("ack").await;
//! });
//!
//! let outcome = client
//!     .request(Message::to_server("ping").with_content("x"), Duration::from_millis(200))
//!     .await?;
//! assert!(outcome.is_received());
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
mod queue;
mod session;

pub use client::{Client, ClientState};
pub use config::ClientConfig;
pub use error::ClientError;
