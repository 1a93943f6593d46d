//! Server-side handle to one authenticated connection.
//!
//! Frames for a client go through a bounded per-session queue drained by its
//! own writer task. A client that stops reading fills its queue and is closed;
//! it never stalls the read loop of whoever is sending to it.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{
    Connection, ConnectionError, ConnectionState, DEFAULT_REPLY_TIMEOUT, Dispatcher, Peer, ReplyOutcome,
    SendError,
};
use courier_proto::{Action, Frame, Message, Reply, SERVER};
use tokio::sync::mpsc::{self, error::TrySendError};

/// One authenticated connection, as seen by handlers and the session registry.
///
/// Cheap to clone; every clone refers to the same socket. Two handles are equal
/// when they refer to the same connection.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    name: String,
    group: String,
    connection: Arc<Connection>,
    outbound: mpsc::Sender<Frame>,
    dispatcher: Arc<Dispatcher<ClientConnection>>,
    released: AtomicBool,
}

impl ClientConnection {
    pub(crate) fn new(
        id: u64,
        name: String,
        group: String,
        connection: Connection,
        dispatcher: Arc<Dispatcher<ClientConnection>>,
        outbound_capacity: usize,
    ) -> Self {
        let connection = Arc::new(connection);
        let (outbound, queue) = mpsc::channel(outbound_capacity.max(1));
        drop(tokio::spawn(drain(Arc::clone(&connection), queue)));

        Self {
            inner: Arc::new(Inner {
                id,
                name,
                group,
                connection,
                outbound,
                dispatcher,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Server-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Authenticated logical name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Authenticated group.
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Remote address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.connection.peer_addr()
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Whether the connection is still live.
    pub fn is_open(&self) -> bool {
        self.inner.connection.is_open()
    }

    /// Close the socket. The read loop notices and deregisters the session.
    pub fn close(&self) -> bool {
        self.inner.connection.close()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }

    /// Queue a frame verbatim. Used for forwarding.
    ///
    /// A session is registered before its `OK` goes out; until then nothing
    /// may be queued ahead of that response. A full queue closes the session.
    pub(crate) fn deliver(&self, frame: &Frame) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Open => {},
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            state => return Err(ConnectionError::InvalidState { state, operation: "deliver" }),
        }

        match self.inner.outbound.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let capacity = self.inner.outbound.max_capacity();
                if self.close() {
                    tracing::warn!(
                        name = %self.name(),
                        id = self.id(),
                        capacity,
                        "outbound queue full, closing session"
                    );
                }
                Err(ConnectionError::Overloaded(capacity))
            },
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Send a message from the server to this connection.
    pub async fn send_message(&self, message: Message) -> Result<(), SendError> {
        self.send_frame(Frame::Message(message)).await
    }

    /// Send an action to this connection's dispatch table.
    pub async fn send_action(&self, action: Action) -> Result<(), SendError> {
        self.send_frame(Frame::Action(action)).await
    }

    /// Send a reply from the server to this connection.
    pub async fn send_reply(&self, reply: Reply) -> Result<(), SendError> {
        self.send_frame(Frame::Reply(reply)).await
    }

    /// Send a correlated message; `callback` fires exactly once.
    ///
    /// Returns the correlation id. Must not be awaited from a handler running
    /// on this connection's read loop if the caller then blocks on the reply.
    pub async fn send_message_with_reply<F>(
        &self,
        mut message: Message,
        timeout: Duration,
        callback: F,
    ) -> Result<u64, SendError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        let replies = self.inner.dispatcher.replies();
        let id = replies.register(Box::new(callback), timeout).ok_or(SendError::Closed)?;
        message.id = id;
        match self.send_message(message).await {
            // Only an entry still pending can be withdrawn; one that fired
            // already gave the callback its outcome.
            Err(e) if replies.remove(id) => Err(e),
            _ => Ok(id),
        }
    }

    /// [`Self::send_message_with_reply`] with [`DEFAULT_REPLY_TIMEOUT`].
    pub async fn send_message_with_callback<F>(&self, message: Message, callback: F) -> Result<u64, SendError>
    where
        F: FnOnce(ReplyOutcome) + Send + 'static,
    {
        self.send_message_with_reply(message, DEFAULT_REPLY_TIMEOUT, callback).await
    }

    /// Send a correlated message and wait for its outcome.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<ReplyOutcome, SendError> {
        let replies = self.inner.dispatcher.replies();
        let (id, outcome) = replies.register_oneshot(timeout).ok_or(SendError::Closed)?;
        message.id = id;
        if let Err(e) = self.send_message(message).await {
            if replies.remove(id) {
                return Err(e);
            }
        }
        outcome.await.map_err(|_| SendError::Closed)
    }
}

/// Write queued frames in order until the connection closes or every handle
/// is gone.
async fn drain(connection: Arc<Connection>, mut queue: mpsc::Receiver<Frame>) {
    loop {
        let next = tokio::select! {
            () = connection.closed() => break,
            next = queue.recv() => next,
        };
        let Some(frame) = next else {
            break;
        };
        if let Err(e) = connection.send(&frame).await {
            tracing::debug!(error = %e, kind = %frame.kind(), "outbound write failed");
            break;
        }
    }
}

/// Stamp server-originated frames with the server's name.
pub(crate) fn stamp_sender(frame: &mut Frame, sender: &str) {
    match frame {
        Frame::Message(message) => sender.clone_into(&mut message.sender),
        Frame::Reply(reply) => sender.clone_into(&mut reply.sender),
        Frame::Action(_) | Frame::AuthRequest(_) | Frame::AuthResponse(_) => {},
    }
}

#[async_trait]
impl Peer for ClientConnection {
    async fn send_frame(&self, mut frame: Frame) -> Result<(), SendError> {
        stamp_sender(&mut frame, SERVER);
        self.deliver(&frame).map_err(|e| match e {
            ConnectionError::Closed => SendError::Closed,
            other => SendError::Connection(other),
        })
    }
}

impl PartialEq for ClientConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientConnection {}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("group", &self.inner.group)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use courier_core::replies::DEFAULT_SWEEP_INTERVAL;

    use super::*;

    /// Open connection named `name`, plus the raw peer end of its stream.
    pub(crate) fn open_session(id: u64, name: &str) -> (ClientConnection, Connection) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(near, None);
        connection.begin_handshake().unwrap();
        connection.mark_open().unwrap();

        let dispatcher = Arc::new(Dispatcher::new(DEFAULT_SWEEP_INTERVAL));
        let session =
            ClientConnection::new(id, name.to_string(), "default".to_string(), connection, dispatcher, 64);
        (session, Connection::new(far, None))
    }

    #[tokio::test]
    async fn server_sends_are_stamped() {
        let (session, peer) = open_session(1, "alice");

        let mut message = Message::new("alice", "news");
        message.sender = "mallory".into();
        session.send_message(message).await.unwrap();

        let Frame::Message(received) = peer.recv().await.unwrap() else { panic!("expected message") };
        assert_eq!(received.sender, SERVER);
    }

    #[tokio::test]
    async fn nothing_is_delivered_before_the_session_opens() {
        let (near, _far) = tokio::io::duplex(1024);
        let connection = Connection::new(near, None);
        connection.begin_handshake().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(DEFAULT_SWEEP_INTERVAL));
        let session = ClientConnection::new(7, "alice".into(), "default".into(), connection, dispatcher, 8);

        let frame = Frame::Message(Message::new("alice", "chat"));
        assert!(matches!(session.deliver(&frame), Err(ConnectionError::InvalidState { .. })));

        session.connection().mark_open().unwrap();
        session.deliver(&frame).unwrap();

        session.close();
        assert!(matches!(session.deliver(&frame), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn full_queue_closes_the_session_without_blocking() {
        // Peer end kept but never read.
        let (near, _far) = tokio::io::duplex(64);
        let connection = Connection::new(near, None);
        connection.begin_handshake().unwrap();
        connection.mark_open().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(DEFAULT_SWEEP_INTERVAL));
        let session = ClientConnection::new(9, "sleepy".into(), "default".into(), connection, dispatcher, 4);

        let frame = Frame::Message(Message::new("sleepy", "chat").with_content("x".repeat(1024)));
        let mut outcome = Ok(());
        for _ in 0..16 {
            outcome = session.deliver(&frame);
            if outcome.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(matches!(outcome, Err(ConnectionError::Overloaded(4))));
        assert!(!session.is_open());
        assert!(matches!(session.deliver(&frame), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn queued_frames_keep_their_order() {
        let (session, peer) = open_session(1, "alice");
        for i in 0..10 {
            session.send_action(Action::new(format!("a{i}"))).await.unwrap();
        }
        for i in 0..10 {
            let Frame::Action(action) = peer.recv().await.unwrap() else { panic!("expected action") };
            assert_eq!(action.name, format!("a{i}"));
        }
    }

    #[tokio::test]
    async fn deliver_forwards_verbatim() {
        let (session, peer) = open_session(1, "alice");

        let mut message = Message::new("alice", "chat");
        message.sender = "bob".into();
        session.deliver(&Frame::Message(message.clone())).unwrap();

        assert_eq!(peer.recv().await.unwrap(), Frame::Message(message));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_answer() {
        let (session, peer) = open_session(1, "alice");

        let outcome = session.request(Message::new("alice", "ping"), Duration::from_millis(200)).await;
        assert_eq!(outcome.unwrap(), ReplyOutcome::TimedOut);

        let Frame::Message(sent) = peer.recv().await.unwrap() else { panic!("expected message") };
        assert_ne!(sent.id, 0);
    }

    #[tokio::test]
    async fn release_happens_once() {
        let (session, _peer) = open_session(1, "alice");
        let clone = session.clone();
        assert!(session.mark_released());
        assert!(!clone.mark_released());
        assert_eq!(session, clone);
    }

    #[tokio::test]
    async fn closed_session_refuses_sends() {
        let (session, _peer) = open_session(1, "alice");
        assert!(session.close());
        assert!(!session.is_open());
        assert!(matches!(session.send_action(Action::new("x")).await, Err(SendError::Closed)));
    }
}
