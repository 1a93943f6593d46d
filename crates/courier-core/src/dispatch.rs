//! Channel and action handler tables.
//!
//! Handlers are keyed by message channel or action name, and several may be
//! registered under one key. They run in registration order on the task that
//! read the frame, one after another, so a slow handler delays the frames
//! behind it on the same connection.
//!
//! The table lock is only held to snapshot the handler list. Handlers are
//! awaited without it and may register further handlers or send frames.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use courier_proto::{Action, Content, Frame, Message, Reply, Result as ProtoResult};
use futures::{FutureExt, future::BoxFuture};
use serde::de::DeserializeOwned;

use crate::{Lifecycle, error::SendError, replies::ReplyRegistry};

/// Anything a handler can send frames through.
///
/// On the server this is the connection a frame arrived on; on the client it
/// is the client itself.
#[async_trait]
pub trait Peer: Clone + Send + Sync + 'static {
    /// Write one frame to the other side.
    async fn send_frame(&self, frame: Frame) -> Result<(), SendError>;
}

type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

struct Handlers<P> {
    state: Lifecycle,
    messages: HashMap<String, Vec<Handler<MessageEvent<P>>>>,
    actions: HashMap<String, Vec<Handler<ActionEvent<P>>>>,
}

/// Handler tables plus the reply registry of one engine.
pub struct Dispatcher<P: Peer> {
    handlers: Mutex<Handlers<P>>,
    replies: ReplyRegistry,
}

impl<P: Peer> Dispatcher<P> {
    /// Empty tables. Must be called inside a Tokio runtime.
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            handlers: Mutex::new(Handlers {
                state: Lifecycle::Open,
                messages: HashMap::new(),
                actions: HashMap::new(),
            }),
            replies: ReplyRegistry::new(sweep_interval),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handlers<P>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handler for messages on `channel`.
    ///
    /// Returns `false` once the dispatcher is closed.
    pub fn add_message_handler<F, Fut>(&self, channel: impl Into<String>, handler: F) -> bool
    where
        F: Fn(MessageEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<MessageEvent<P>> =
            Arc::new(move |event: MessageEvent<P>| handler(event).boxed());
        let mut handlers = self.lock();
        if handlers.state == Lifecycle::Closed {
            return false;
        }
        handlers.messages.entry(channel.into()).or_default().push(handler);
        true
    }

    /// Add a handler for actions named `name`.
    ///
    /// Returns `false` once the dispatcher is closed.
    pub fn add_action_handler<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(ActionEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<ActionEvent<P>> =
            Arc::new(move |event: ActionEvent<P>| handler(event).boxed());
        let mut handlers = self.lock();
        if handlers.state == Lifecycle::Closed {
            return false;
        }
        handlers.actions.entry(name.into()).or_default().push(handler);
        true
    }

    /// Run every handler registered for the message's channel.
    ///
    /// Returns the number of handlers run. Zero means the message was dropped.
    pub async fn handle_message(&self, message: Message, peer: P) -> usize {
        let snapshot = {
            let handlers = self.lock();
            if handlers.state == Lifecycle::Closed {
                return 0;
            }
            handlers.messages.get(&message.channel).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            tracing::debug!(channel = %message.channel, "no handler for channel");
            return 0;
        }

        for handler in &snapshot {
            handler(MessageEvent { message: message.clone(), peer: peer.clone() }).await;
        }
        snapshot.len()
    }

    /// Run every handler registered for the action's name.
    pub async fn handle_action(&self, action: Action, peer: P) -> usize {
        let snapshot = {
            let handlers = self.lock();
            if handlers.state == Lifecycle::Closed {
                return 0;
            }
            handlers.actions.get(&action.name).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            tracing::debug!(action = %action.name, "no handler for action");
            return 0;
        }

        for handler in &snapshot {
            handler(ActionEvent { action: action.clone(), peer: peer.clone() }).await;
        }
        snapshot.len()
    }

    /// Deliver a reply to the registry.
    pub fn handle_reply(&self, reply: Reply) -> bool {
        let id = reply.id;
        let delivered = self.replies.handle_reply(reply);
        if !delivered {
            tracing::trace!(id, "reply without pending request");
        }
        delivered
    }

    /// Pending-reply registry.
    pub fn replies(&self) -> &ReplyRegistry {
        &self.replies
    }

    /// Number of channels with at least one handler.
    pub fn message_channels(&self) -> usize {
        self.lock().messages.len()
    }

    /// Number of action names with at least one handler.
    pub fn action_names(&self) -> usize {
        self.lock().actions.len()
    }

    /// Drop every handler and pending reply. Idempotent.
    pub fn close(&self) {
        let (messages, actions) = {
            let mut handlers = self.lock();
            handlers.state = Lifecycle::Closed;
            (std::mem::take(&mut handlers.messages), std::mem::take(&mut handlers.actions))
        };
        drop((messages, actions));
        self.replies.close();
    }

    /// Whether handlers are still accepted and run.
    pub fn is_open(&self) -> bool {
        self.lock().state == Lifecycle::Open
    }
}

impl<P: Peer> std::fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.lock();
        f.debug_struct("Dispatcher")
            .field("state", &handlers.state)
            .field("channels", &handlers.messages.len())
            .field("actions", &handlers.actions.len())
            .field("replies", &self.replies)
            .finish()
    }
}

/// A message delivered to a handler, with the peer it came from.
#[derive(Clone)]
pub struct MessageEvent<P> {
    message: Message,
    peer: P,
}

impl<P: Peer> MessageEvent<P> {
    /// Pair a message with the peer it arrived from.
    pub fn new(message: Message, peer: P) -> Self {
        Self { message, peer }
    }

    /// The message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Take the message.
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Authenticated name of the sender.
    pub fn sender(&self) -> &str {
        &self.message.sender
    }

    /// Channel the message was sent on.
    pub fn channel(&self) -> &str {
        &self.message.channel
    }

    /// Raw content.
    pub fn content(&self) -> &Content {
        &self.message.content
    }

    /// Deserialize the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> ProtoResult<T> {
        self.message.content_as()
    }

    /// Connection or client the message arrived on.
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Answer the sender on the same channel with the message's id.
    ///
    /// Does nothing and returns `Ok(false)` when the sender did not ask for a
    /// reply.
    pub async fn reply(&self, content: impl Into<Content>) -> Result<bool, SendError> {
        if !self.message.expects_reply() {
            return Ok(false);
        }
        let reply = Reply::answering(&self.message, content);
        self.peer.send_frame(Frame::Reply(reply)).await?;
        Ok(true)
    }

    /// Send a new message through the same peer.
    pub async fn send_message(&self, message: Message) -> Result<(), SendError> {
        self.peer.send_frame(Frame::Message(message)).await
    }
}

impl<P> std::fmt::Debug for MessageEvent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEvent").field("message", &self.message).finish_non_exhaustive()
    }
}

/// An action delivered to a handler.
#[derive(Clone)]
pub struct ActionEvent<P> {
    action: Action,
    peer: P,
}

impl<P: Peer> ActionEvent<P> {
    /// Pair an action with the peer it arrived from.
    pub fn new(action: Action, peer: P) -> Self {
        Self { action, peer }
    }

    /// The action.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Take the action.
    pub fn into_action(self) -> Action {
        self.action
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.action.name
    }

    /// Raw content.
    pub fn content(&self) -> &Content {
        &self.action.content
    }

    /// Deserialize the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> ProtoResult<T> {
        self.action.content_as()
    }

    /// Connection or client the action arrived on.
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Send an action back through the same peer.
    pub async fn send_action(&self, action: Action) -> Result<(), SendError> {
        self.peer.send_frame(Frame::Action(action)).await
    }
}

impl<P> std::fmt::Debug for ActionEvent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEvent").field("action", &self.action).finish_non_exhaustive()
    }
}
