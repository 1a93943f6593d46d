//! Listener and server-wide API.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_core::{
    ActionEvent, Authenticator, DEFAULT_REPLY_TIMEOUT, Dispatcher, Lifecycle, Listener, MessageEvent, Peer,
    ReplyOutcome, TcpListener, error::log_failure,
};
use courier_proto::{Action, Frame, Message, Recipient, Reply};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig, error::ServerError, handler, registry::SessionRegistry,
    session::ClientConnection,
};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) dispatcher: Arc<Dispatcher<ClientConnection>>,
    pub(crate) shutdown: CancellationToken,
    state: Mutex<Lifecycle>,
    next_id: AtomicU64,
    local_addr: SocketAddr,
}

impl Shared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A running broker.
///
/// Cheap to clone. The accept loop keeps running until [`Server::close`] is
/// called; dropping every handle does not stop it.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Bind a TCP listener on `addr` and start accepting.
    pub async fn bind(
        addr: &str,
        authenticator: impl Authenticator,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, authenticator, config)
    }

    /// Start accepting on an already-bound listener.
    ///
    /// Must be called inside a Tokio runtime. Returns once the accept loop is
    /// running.
    pub fn serve<L: Listener>(
        listener: L,
        authenticator: impl Authenticator,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            dispatcher: Arc::new(Dispatcher::new(config.reply_sweep_interval)),
            config,
            authenticator: Arc::new(authenticator),
            sessions: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
            state: Mutex::new(Lifecycle::Open),
            next_id: AtomicU64::new(1),
            local_addr,
        });

        tracing::info!(
            addr = %local_addr,
            max_clients = shared.config.max_clients,
            max_same_client = shared.config.max_same_client,
            routing = %shared.config.routing_level,
            "server listening"
        );
        drop(tokio::spawn(accept_loop(Arc::clone(&shared), listener)));
        Ok(Self { shared })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Registry of authenticated sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    /// Register a handler for messages addressed to `"server"` on `channel`.
    pub fn on_message<F, Fut>(&self, channel: impl Into<String>, handler: F) -> bool
    where
        F: Fn(MessageEvent<ClientConnection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.dispatcher.add_message_handler(channel, handler)
    }

    /// Register a handler for actions named `name`.
    pub fn on_action<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(ActionEvent<ClientConnection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.dispatcher.add_action_handler(name, handler)
    }

    fn targets(&self, recipient: &str) -> Vec<ClientConnection> {
        match Recipient::parse(recipient) {
            Recipient::All => self.shared.sessions.get_all_users(),
            Recipient::Named(name) => self.shared.sessions.get_user(name),
            Recipient::Server => {
                tracing::debug!("server-originated frame addressed to server dropped");
                Vec::new()
            },
        }
    }

    async fn send_to(&self, recipient: &str, frame: Frame) -> Result<usize, ServerError> {
        if !self.is_open() {
            return Err(ServerError::Closed);
        }

        let mut delivered = 0;
        for target in self.targets(recipient) {
            match target.send_frame(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => log_failure(self.shared.config.debug, "server send failed", &e),
            }
        }
        Ok(delivered)
    }

    /// Send a message to `"all"` or to a named client's connections.
    ///
    /// Not gated by the routing level. Returns the number of connections the
    /// message was queued for.
    pub async fn send_message(&self, message: Message) -> Result<usize, ServerError> {
        let recipient = message.recipient.clone();
        self.send_to(&recipient, Frame::Message(message)).await
    }

    /// Send an action to `"all"` or to a named client's connections.
    pub async fn send_action(&self, recipient: &str, action: Action) -> Result<usize, ServerError> {
        self.send_to(recipient, Frame::Action(action)).await
    }

    /// Send a reply to the connections of `reply.recipient`.
    pub async fn send_reply(&self, reply: Reply) -> Result<usize, ServerError> {
        let recipient = reply.recipient.clone();
        self.send_to(&recipient, Frame::Reply(reply)).await
    }

    /// Send a correlated message; `callback` fires exactly once.
    ///
    /// When several connections receive the message, the first reply wins.
    pub async fn send_message_with_reply<F>(
        &self,
        mut message: Message,
        timeout: Duration,
        callback: F,
    ) -> Result<u64, ServerError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        let replies = self.shared.dispatcher.replies();
        let id = replies.register(Box::new(callback), timeout).ok_or(ServerError::Closed)?;
        message.id = id;
        match self.send_message(message).await {
            Err(e) if replies.remove(id) => Err(e),
            _ => Ok(id),
        }
    }

    /// [`Self::send_message_with_reply`] with [`DEFAULT_REPLY_TIMEOUT`].
    pub async fn send_message_with_callback<F>(&self, message: Message, callback: F) -> Result<u64, ServerError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        self.send_message_with_reply(message, DEFAULT_REPLY_TIMEOUT, callback).await
    }

    /// Send a correlated message and wait for the outcome.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<ReplyOutcome, ServerError> {
        let replies = self.shared.dispatcher.replies();
        let (id, outcome) = replies.register_oneshot(timeout).ok_or(ServerError::Closed)?;
        message.id = id;
        if let Err(e) = self.send_message(message).await {
            if replies.remove(id) {
                return Err(e);
            }
        }
        outcome.await.map_err(|_| ServerError::Closed)
    }

    /// Stop accepting, close every session and drop all handlers.
    ///
    /// Returns `false` if the server was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == Lifecycle::Closed {
                return false;
            }
            *state = Lifecycle::Closed;
        }

        self.shared.shutdown.cancel();
        let sessions = self.shared.sessions.close();
        self.shared.dispatcher.close();
        tracing::info!(addr = %self.shared.local_addr, sessions, "server closed");
        true
    }

    /// Whether the server is still running.
    pub fn is_open(&self) -> bool {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Open
    }

    /// Resolves once [`Server::close`] has been called.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("open", &self.is_open())
            .field("sessions", &self.shared.sessions)
            .finish_non_exhaustive()
    }
}

async fn accept_loop<L: Listener>(shared: Arc<Shared>, listener: L) {
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                drop(tokio::spawn(handler::run(Arc::clone(&shared), stream, peer)));
            },
            Err(e) => {
                log_failure(shared.config.debug, "accept failed", &e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            },
        }
    }
    tracing::debug!(addr = %shared.local_addr, "accept loop stopped");
}
