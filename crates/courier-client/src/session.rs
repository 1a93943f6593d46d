//! Reconnect state machine.
//!
//! ```text
//!                ┌───────────────── retry_delay ─────────────────┐
//!                ↓                                                │
//! ┌──────────────┐  connect   ┌────────────┐  send creds  ┌────────────────┐
//! │ Disconnected │───────────>│ Connecting │─────────────>│ Authenticating │
//! └──────────────┘            └────────────┘              └────────────────┘
//!        ↑                          │ failure                 │ OK   │ fatal code
//!        │ connection lost          ↓                         ↓      ↓
//!        │                    attempts += 1            ┌───────────┐ ┌─────────┐
//!        └─────────────────────────────────────────────│ Connected │ │ Stopped │
//!                                                      └───────────┘ └─────────┘
//! ```
//!
//! Every failed attempt, transient rejection or lost connection counts
//! against `max_retry`; reaching it stops the client. Entering `Connected`
//! resets the count.

use std::sync::Arc;

use courier_core::{Connection, ConnectionError, Connector};
use courier_proto::{AuthCode, Frame};
use tokio::sync::oneshot;

use crate::{
    client::{Client, ClientState},
    error::ClientError,
};

/// How one connection attempt ended.
#[derive(Debug)]
enum Attempt {
    /// Authenticated
    Connected(Arc<Connection>),
    /// Server answered with a non-OK code
    Rejected(AuthCode),
    /// Transport or protocol failure before a verdict
    Failed(ConnectionError),
}

type Ready = oneshot::Sender<Result<(), ClientError>>;

/// Drive the client until it is closed or runs out of retries.
///
/// `ready` resolves once, after the first attempt.
pub(crate) async fn run<C: Connector>(client: Client, connector: C, ready: Ready) {
    let mut ready = Some(ready);
    let mut failures: u32 = 0;

    loop {
        if client.inner.stop.is_cancelled() {
            break;
        }

        let attempt = tokio::select! {
            () = client.inner.stop.cancelled() => break,
            attempt = connect(&client, &connector) => attempt,
        };

        match attempt {
            Attempt::Connected(connection) => {
                failures = 0;
                if !go_live(&client, &connection) {
                    let _ = connection.close();
                    break;
                }
                notify(&mut ready, Ok(()));

                read_loop(&client, &connection).await;

                go_down(&client, &connection);
                if client.inner.stop.is_cancelled() {
                    break;
                }
                tracing::info!(name = %client.name(), "connection lost");
            },
            Attempt::Rejected(code) if code.is_fatal() => {
                tracing::warn!(name = %client.name(), %code, "rejected by server, giving up");
                notify(&mut ready, Err(ClientError::Rejected(code)));
                let _ = client.close();
                break;
            },
            Attempt::Rejected(code) => {
                tracing::info!(name = %client.name(), %code, attempt = failures + 1, "rejected by server");
            },
            Attempt::Failed(e) => {
                client.log_failure("connection attempt failed", &e);
            },
        }

        failures += 1;
        if failures >= client.inner.config.max_retry {
            tracing::warn!(name = %client.name(), failures, "retry budget exhausted");
            notify(&mut ready, Err(ClientError::Stopped));
            let _ = client.close();
            break;
        }

        let _ = client.set_state(ClientState::Disconnected);
        notify(&mut ready, Ok(()));

        tokio::select! {
            () = client.inner.stop.cancelled() => break,
            () = tokio::time::sleep(client.inner.config.retry_delay) => {},
        }
    }

    notify(&mut ready, Err(ClientError::Stopped));
}

fn notify(ready: &mut Option<Ready>, result: Result<(), ClientError>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(result);
    }
}

/// One connect-and-authenticate attempt.
async fn connect<C: Connector>(client: &Client, connector: &C) -> Attempt {
    let _ = client.set_state(ClientState::Connecting);
    let limit = client.inner.config.connect_timeout;
    let stream = match tokio::time::timeout(limit, connector.connect(client.addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Attempt::Failed(ConnectionError::Io(e)),
        Err(_) => return Attempt::Failed(ConnectionError::Timeout(limit)),
    };

    let connection = Arc::new(Connection::new(stream, None));
    if let Err(e) = connection.begin_handshake() {
        return Attempt::Failed(e);
    }
    let _ = client.set_state(ClientState::Authenticating);

    let request = Frame::AuthRequest(client.inner.credentials.clone());
    if let Err(e) = connection.send(&request).await {
        return Attempt::Failed(e);
    }

    let verdict = match connection.recv_timeout(client.inner.config.handshake_timeout).await {
        Ok(Frame::AuthResponse(response)) => response.code,
        Ok(other) => {
            tracing::debug!(kind = %other.kind(), "expected auth response");
            connection.shutdown().await;
            return Attempt::Failed(ConnectionError::InvalidState {
                state: connection.state(),
                operation: "handshake",
            });
        },
        Err(e) => {
            connection.shutdown().await;
            return Attempt::Failed(e);
        },
    };

    client.record_auth(verdict);
    if !verdict.is_ok() {
        connection.shutdown().await;
        return Attempt::Rejected(verdict);
    }

    match connection.mark_open() {
        Ok(()) => Attempt::Connected(connection),
        Err(e) => Attempt::Failed(e),
    }
}

/// Install the connection and start draining the queue.
///
/// Returns `false` if the client was closed meanwhile.
fn go_live(client: &Client, connection: &Arc<Connection>) -> bool {
    let spawn_flush = {
        let mut link = client.link();
        if client.inner.stop.is_cancelled() {
            return false;
        }
        link.connection = Some(Arc::clone(connection));
        let _ = client.set_state(ClientState::Connected);
        let idle = !link.queue.flushing && !link.queue.is_empty();
        if idle {
            link.queue.flushing = true;
        }
        idle
    };

    tracing::info!(name = %client.name(), addr = %client.addr(), "connected");
    if spawn_flush {
        drop(tokio::spawn(flush(client.clone())));
    }
    true
}

/// Uninstall a dead connection.
fn go_down(client: &Client, connection: &Arc<Connection>) {
    let _ = connection.close();
    let mut link = client.link();
    if link.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
        link.connection = None;
    }
    let _ = client.set_state(ClientState::Disconnected);
}

/// Write queued sends in order on whatever connection is live.
///
/// Stops when the queue is empty or there is no live connection; the next
/// `go_live` starts a new flush.
async fn flush(client: Client) {
    let mut sent = 0usize;
    loop {
        let (connection, item) = {
            let mut link = client.link();
            let Some(connection) = link.connection.clone() else {
                link.queue.flushing = false;
                break;
            };
            let Some(item) = link.queue.pop() else {
                link.queue.flushing = false;
                break;
            };
            (connection, item)
        };

        match client.write(&connection, item).await {
            Ok(()) => sent += 1,
            Err(failure) => {
                client.log_failure("queued send failed", &failure.error);
                let mut link = client.link();
                if let Some(item) = failure.item {
                    link.queue.push_front(item);
                }
                let same = link.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, &connection));
                if connection.is_closed() && (same || link.connection.is_none()) {
                    link.queue.flushing = false;
                    break;
                }
            },
        }
    }

    if sent > 0 {
        tracing::debug!(name = %client.name(), sent, "flushed queued sends");
    }
}

async fn read_loop(client: &Client, connection: &Connection) {
    let dispatcher = &client.inner.dispatcher;
    loop {
        match connection.recv().await {
            Ok(Frame::Message(message)) => {
                let _ = dispatcher.handle_message(message, client.clone()).await;
            },
            Ok(Frame::Action(action)) => {
                let _ = dispatcher.handle_action(action, client.clone()).await;
            },
            Ok(Frame::Reply(reply)) => {
                let _ = dispatcher.handle_reply(reply);
            },
            Ok(other) => {
                tracing::debug!(kind = %other.kind(), "unexpected frame dropped");
            },
            Err(e) if e.is_recoverable() => client.log_failure("dropped undecodable frame", &e),
            Err(ConnectionError::Closed) => break,
            Err(e) => {
                client.log_failure("connection failed", &e);
                break;
            },
        }
    }
}
