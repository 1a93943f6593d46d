//! Bounded FIFO of sends issued while not connected.

use std::{collections::VecDeque, time::Duration};

use courier_core::{ReplyCallback, SendError};
use courier_proto::{Frame, Message};

/// One deferred send.
pub(crate) enum Queued {
    /// Fire-and-forget frame
    Frame(Frame),
    /// Message whose reply entry is registered when it is finally written
    Correlated { message: Message, timeout: Duration, callback: ReplyCallback },
}

impl std::fmt::Debug for Queued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(frame) => f.debug_tuple("Frame").field(&frame.kind()).finish(),
            Self::Correlated { message, timeout, .. } => f
                .debug_struct("Correlated")
                .field("channel", &message.channel)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SendQueue {
    items: VecDeque<Queued>,
    capacity: usize,
    /// A flush task is draining the queue
    pub(crate) flushing: bool,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity, flushing: false }
    }

    /// Append at the back; fails when full.
    pub(crate) fn push(&mut self, item: Queued) -> Result<(), SendError> {
        if self.items.len() >= self.capacity {
            return Err(SendError::QueueFull(self.items.len()));
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Put back an item that failed to flush. Ignores the capacity, since the
    /// item already held a slot.
    pub(crate) fn push_front(&mut self, item: Queued) {
        self.items.push_front(item);
    }

    pub(crate) fn pop(&mut self) -> Option<Queued> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Nothing queued and nothing draining, so a send may go straight out.
    pub(crate) fn is_idle(&self) -> bool {
        !self.flushing && self.items.is_empty()
    }

    /// Drop everything; pending callbacks are dropped unfired.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
