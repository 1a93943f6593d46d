//! Per-socket task: handshake, read loop, release.

use std::{net::SocketAddr, sync::Arc};

use courier_core::{Connection, ConnectionError, error::log_failure};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{handshake, router, server::Shared, session::ClientConnection};

/// Drive one accepted socket until it closes or the server stops.
pub(crate) async fn run<S>(shared: Arc<Shared>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection = Connection::new(stream, Some(peer));

    let accepted = tokio::select! {
        () = shared.shutdown.cancelled() => None,
        client = handshake::accept(&shared, connection) => client,
    };
    let Some(client) = accepted else {
        return;
    };

    read_loop(&shared, &client).await;
    release(&shared, &client).await;
}

async fn read_loop(shared: &Shared, client: &ClientConnection) {
    loop {
        match client.connection().recv().await {
            Ok(frame) => router::route(shared, client, frame).await,
            Err(e) if e.is_recoverable() => {
                log_failure(shared.config.debug, "dropped undecodable frame", &e);
            },
            Err(ConnectionError::Closed) => break,
            Err(e) => {
                log_failure(shared.config.debug, "connection failed", &e);
                break;
            },
        }
    }
}

/// Deregister and close, once per connection.
pub(crate) async fn release(shared: &Shared, client: &ClientConnection) {
    if !client.mark_released() {
        return;
    }
    let _ = shared.sessions.remove(client);
    client.connection().shutdown().await;
    tracing::info!(name = %client.name(), id = client.id(), "session closed");
}
