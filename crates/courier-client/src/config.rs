//! Client configuration.

use std::time::Duration;

use courier_core::replies::DEFAULT_SWEEP_INTERVAL;

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pause between reconnect attempts
    pub retry_delay: Duration,
    /// Consecutive failed attempts before the client stops for good
    pub max_retry: u32,
    /// Sends held while not connected
    pub max_queued: usize,
    /// Time allowed for one transport connect attempt
    pub connect_timeout: Duration,
    /// Time allowed for the server's `AuthResponse`
    pub handshake_timeout: Duration,
    /// Period of the reply registry's expiry sweep
    pub reply_sweep_interval: Duration,
    /// Report connection failures at `warn` instead of `debug`
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            max_retry: 20,
            max_queued: 256,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            reply_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            debug: false,
        }
    }
}
