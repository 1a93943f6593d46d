//! Deterministic simulation harness for Courier.
//!
//! Turmoil-based [`Listener`](courier_core::Listener) and
//! [`Connector`](courier_core::Connector) implementations, so the real broker
//! and client run unchanged over a simulated network with controllable
//! latency, held links and seeded randomness.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod sim_transport;

pub use broker::{BROKER_HOST, BROKER_PORT, broker_addr, seeded_rng, serve_broker};
pub use sim_transport::{SimConnector, SimListener};
