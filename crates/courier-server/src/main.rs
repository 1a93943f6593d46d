//! Courier broker binary.

use clap::Parser;
use courier_core::TokenVerifier;
use courier_server::{RoutingLevel, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about = "Courier message broker")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:7878")]
    bind: String,

    /// Shared key client tokens are derived from
    #[arg(long, env = "COURIER_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Global cap on authenticated connections
    #[arg(long, default_value_t = 50)]
    max_clients: usize,

    /// Cap on connections sharing one name
    #[arg(long, default_value_t = 10)]
    max_same_client: usize,

    /// Client-to-client forwarding: nothing, single or all
    #[arg(long, default_value_t = RoutingLevel::Single)]
    routing_level: RoutingLevel,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value_t = 3000)]
    handshake_timeout_ms: u64,

    /// Frames queued per session before a slow reader is dropped
    #[arg(long, default_value_t = 256)]
    outbound_capacity: usize,

    /// Report connection failures at warn level
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).try_init()?;

    let config = ServerConfig {
        max_clients: args.max_clients,
        max_same_client: args.max_same_client,
        routing_level: args.routing_level,
        handshake_timeout: std::time::Duration::from_millis(args.handshake_timeout_ms),
        outbound_capacity: args.outbound_capacity,
        debug: args.debug,
        ..ServerConfig::default()
    };

    let server = Server::bind(&args.bind, TokenVerifier::new(args.private_key), config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, stopping");
    let _ = server.close();

    Ok(())
}
