//! Broker setup shared by simulation tests.

use courier_core::Authenticator;
use courier_server::{Server, ServerConfig, ServerError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::sim_transport::SimListener;

/// Host name the broker runs under.
pub const BROKER_HOST: &str = "broker";

/// Port the broker listens on.
pub const BROKER_PORT: u16 = 7878;

/// Address clients dial.
pub fn broker_addr() -> String {
    format!("{BROKER_HOST}:{BROKER_PORT}")
}

/// Start a broker on the current simulated host.
///
/// Call from inside a `sim.host(..)` closure; the returned server keeps
/// running until closed.
pub async fn serve_broker(
    authenticator: impl Authenticator,
    config: ServerConfig,
) -> Result<Server, ServerError> {
    let listener = SimListener::bind(&format!("0.0.0.0:{BROKER_PORT}")).await?;
    Server::serve(listener, authenticator, config)
}

/// RNG for scenario choices; same seed, same run.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}
