//! Public client handle.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{
    ActionEvent, Connection, ConnectionError, Connector, DEFAULT_REPLY_TIMEOUT, Dispatcher, MessageEvent,
    Peer, ReplyOutcome, SendError, TcpConnector, error::log_failure,
};
use courier_proto::{Action, AuthCode, Credentials, Frame, Message, Reply};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ClientConfig,
    error::ClientError,
    queue::{Queued, SendQueue},
    session,
};

/// Where the client is in its connect/authenticate/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Waiting to retry
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Credentials sent, waiting for the verdict
    Authenticating,
    /// Authenticated; sends go straight out
    Connected,
    /// Closed or out of retries; terminal
    Stopped,
}

/// Live connection and deferred sends, guarded together so that a send
/// either goes out on the current connection or joins the queue in order.
pub(crate) struct Link {
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) queue: SendQueue,
}

pub(crate) struct Inner {
    pub(crate) addr: String,
    pub(crate) credentials: Credentials,
    pub(crate) config: ClientConfig,
    pub(crate) dispatcher: Dispatcher<Client>,
    pub(crate) state: watch::Sender<ClientState>,
    pub(crate) link: Mutex<Link>,
    pub(crate) last_auth: Mutex<Option<AuthCode>>,
    pub(crate) stop: CancellationToken,
}

/// A reconnecting client session.
///
/// Cheap to clone. The background session keeps running until
/// [`Client::close`] is called or the retry budget runs out.
///
/// Handlers run on the task that reads the connection. A handler that waits
/// for a reply to its own request blocks the very loop that would deliver it;
/// use [`Client::send_message_with_reply`] from handlers instead.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

/// A write that did not happen, with whatever can be retried.
pub(crate) struct WriteFailure {
    pub(crate) item: Option<Queued>,
    pub(crate) error: SendError,
}

impl Client {
    /// Connect over TCP to `addr` (`host:port`).
    pub async fn connect(
        addr: impl Into<String>,
        credentials: Credentials,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::with_connector(TcpConnector, addr, credentials, config).await
    }

    /// Connect through `connector`.
    ///
    /// Returns once the first attempt resolves. A transient failure still
    /// yields a client, which keeps retrying in the background; a fatal
    /// rejection or an exhausted retry budget is an error.
    pub async fn with_connector<C: Connector>(
        connector: C,
        addr: impl Into<String>,
        credentials: Credentials,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let client = Self {
            inner: Arc::new(Inner {
                addr: addr.into(),
                dispatcher: Dispatcher::new(config.reply_sweep_interval),
                link: Mutex::new(Link { connection: None, queue: SendQueue::new(config.max_queued) }),
                credentials,
                config,
                state,
                last_auth: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        drop(tokio::spawn(session::run(client.clone(), connector, ready_tx)));

        match ready_rx.await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => {
                let _ = client.close();
                Err(e)
            },
            Err(_) => {
                let _ = client.close();
                Err(ClientError::Stopped)
            },
        }
    }

    pub(crate) fn link(&self) -> MutexGuard<'_, Link> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logical name this client authenticates as.
    pub fn name(&self) -> &str {
        &self.inner.credentials.name
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Whether sends currently go straight out.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Wait until the client reaches `target` or stops.
    ///
    /// Returns the state that ended the wait.
    pub async fn wait_for_state(&self, target: ClientState) -> ClientState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|s| *s == target || *s == ClientState::Stopped).await {
            Ok(state) => *state,
            Err(_) => ClientState::Stopped,
        }
    }

    /// Most recent `AuthResponse` code from the server.
    pub fn last_auth_code(&self) -> Option<AuthCode> {
        *self.inner.last_auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sends waiting for a connection.
    pub fn queued(&self) -> usize {
        self.link().queue.len()
    }

    /// Register a handler for messages on `channel`.
    pub fn on_message<F, Fut>(&self, channel: impl Into<String>, handler: F) -> bool
    where
        F: Fn(MessageEvent<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.add_message_handler(channel, handler)
    }

    /// Register a handler for actions named `name`.
    pub fn on_action<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(ActionEvent<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.add_action_handler(name, handler)
    }

    /// Send a message. Queued while not connected.
    pub async fn send_message(&self, message: Message) -> Result<(), SendError> {
        self.submit(Queued::Frame(Frame::Message(message))).await
    }

    /// Send an action to the server's dispatch table. Queued while not
    /// connected.
    pub async fn send_action(&self, action: Action) -> Result<(), SendError> {
        self.submit(Queued::Frame(Frame::Action(action))).await
    }

    /// Send a reply. Queued while not connected.
    pub async fn send_reply(&self, reply: Reply) -> Result<(), SendError> {
        self.submit(Queued::Frame(Frame::Reply(reply))).await
    }

    /// Send a correlated message; `callback` fires exactly once with the
    /// reply or with [`ReplyOutcome::TimedOut`].
    ///
    /// A fresh random id is assigned when the message is written. If the
    /// message is queued, its timeout starts when it is flushed. When this
    /// returns an error the callback is dropped without being called; a
    /// callback that already fired means the send resolved and this returns
    /// `Ok`.
    pub async fn send_message_with_reply<F>(
        &self,
        message: Message,
        timeout: Duration,
        callback: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        self.submit(Queued::Correlated { message, timeout, callback: Box::new(callback) }).await
    }

    /// [`Self::send_message_with_reply`] with [`DEFAULT_REPLY_TIMEOUT`].
    pub async fn send_message_with_callback<F>(&self, message: Message, callback: F) -> Result<(), SendError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        self.send_message_with_reply(message, DEFAULT_REPLY_TIMEOUT, callback).await
    }

    /// Send a correlated message and wait for its outcome.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<ReplyOutcome, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send_message_with_reply(message, timeout, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;
        rx.await.map_err(|_| SendError::Closed)
    }

    async fn submit(&self, item: Queued) -> Result<(), SendError> {
        let connection = {
            let mut link = self.link();
            if self.state() == ClientState::Stopped {
                return Err(SendError::Closed);
            }
            match link.connection.clone() {
                Some(connection) if link.queue.is_idle() => connection,
                _ => return link.queue.push(item),
            }
        };

        self.write(&connection, item).await.map_err(|failure| failure.error)
    }

    /// Write one item, registering its reply entry first if it has one.
    pub(crate) async fn write(&self, connection: &Connection, item: Queued) -> Result<(), WriteFailure> {
        match item {
            Queued::Frame(frame) => match connection.send(&frame).await {
                Ok(()) => Ok(()),
                Err(e) => Err(WriteFailure::new(Queued::Frame(frame), e)),
            },
            Queued::Correlated { mut message, timeout, callback } => {
                let replies = self.inner.dispatcher.replies();
                let Some(id) = replies.register(callback, timeout) else {
                    return Err(WriteFailure { item: None, error: SendError::Closed });
                };
                message.id = id;

                let frame = Frame::Message(message);
                let Err(e) = connection.send(&frame).await else {
                    return Ok(());
                };

                let Frame::Message(mut message) = frame else {
                    return Err(WriteFailure { item: None, error: to_send_error(e) });
                };
                message.id = 0;
                match replies.take(id) {
                    Some(callback) => Err(WriteFailure::new(Queued::Correlated { message, timeout, callback }, e)),
                    // Expired while the write was stuck; the callback has its outcome.
                    None => Ok(()),
                }
            },
        }
    }

    /// Stop for good: no reconnects, no handlers, no pending callbacks.
    ///
    /// Returns `false` if the client had already stopped.
    pub fn close(&self) -> bool {
        let first = !self.inner.stop.is_cancelled();
        self.inner.stop.cancel();

        let (connection, dropped) = {
            let mut link = self.link();
            let _ = self.inner.state.send_replace(ClientState::Stopped);
            (link.connection.take(), link.queue.clear())
        };
        if let Some(connection) = connection {
            let _ = connection.close();
        }
        self.inner.dispatcher.close();

        if first {
            tracing::debug!(name = %self.name(), dropped, "client closed");
        }
        first
    }

    /// Report a failure at the configured level.
    pub(crate) fn log_failure(&self, context: &str, error: &dyn std::error::Error) {
        log_failure(self.inner.config.debug, context, error);
    }

    /// Move to `state` unless already stopped. Returns whether it changed.
    pub(crate) fn set_state(&self, state: ClientState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if *current == ClientState::Stopped || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    pub(crate) fn record_auth(&self, code: AuthCode) {
        *self.inner.last_auth.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }
}

impl WriteFailure {
    /// Keep the item for another try only when the transport failed; an
    /// encoding error would fail again.
    fn new(item: Queued, error: ConnectionError) -> Self {
        let retry = matches!(error, ConnectionError::Closed | ConnectionError::Io(_));
        Self { item: retry.then_some(item), error: to_send_error(error) }
    }
}

fn to_send_error(error: ConnectionError) -> SendError {
    match error {
        ConnectionError::Closed => SendError::NotConnected,
        other => SendError::Connection(other),
    }
}

#[async_trait]
impl Peer for Client {
    async fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.submit(Queued::Frame(frame)).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Client with no session task behind it.
    fn detached(config: ClientConfig) -> Client {
        let (state, _) = watch::channel(ClientState::Connected);
        Client {
            inner: Arc::new(Inner {
                addr: "127.0.0.1:0".into(),
                credentials: Credentials::new("alice", ""),
                dispatcher: Dispatcher::new(config.reply_sweep_interval),
                link: Mutex::new(Link { connection: None, queue: SendQueue::new(config.max_queued) }),
                config,
                state,
                last_auth: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
        }
    }

    #[tokio::test]
    async fn expired_entry_makes_a_failed_write_resolved() {
        let client = detached(ClientConfig::default());
        // Peer never reads, so the write stalls until the peer goes away.
        let (near, far) = tokio::io::duplex(64);
        let connection = Connection::new(near, None);

        let fired = Arc::new(AtomicUsize::new(0));
        let outcomes = Arc::clone(&fired);
        let item = Queued::Correlated {
            message: Message::new("bob", "ping").with_content("x".repeat(4096)),
            timeout: Duration::from_millis(5),
            callback: Box::new(move |outcome| {
                assert_eq!(outcome, ReplyOutcome::TimedOut);
                outcomes.fetch_add(1, Ordering::SeqCst);
            }),
        };

        let (written, ()) = tokio::join!(client.write(&connection, item), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(far);
        });

        assert!(written.is_ok());
        assert!(connection.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(client.inner.dispatcher.replies().is_empty());
    }

    #[tokio::test]
    async fn pending_entry_is_handed_back_on_failure() {
        let client = detached(ClientConfig::default());
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let connection = Connection::new(near, None);

        let fired = Arc::new(AtomicUsize::new(0));
        let outcomes = Arc::clone(&fired);
        let item = Queued::Correlated {
            message: Message::new("bob", "ping"),
            timeout: Duration::from_secs(5),
            callback: Box::new(move |_| {
                outcomes.fetch_add(1, Ordering::SeqCst);
            }),
        };

        let Err(failure) = client.write(&connection, item).await else { panic!("write should fail") };
        let Some(Queued::Correlated { message, .. }) = failure.item else { panic!("item should be retried") };
        assert_eq!(message.id, 0);
        assert!(client.inner.dispatcher.replies().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
