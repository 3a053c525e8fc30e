//! Keeps one request in flight while pipelined heads queue behind it.
//!
//! Heads arriving while a response is still outstanding are parked in FIFO order and released
//! one at a time as responses complete. Queued requests must not carry a body: buffering bodies
//! of parked requests is not supported, and such a request fails the connection.

use std::collections::VecDeque;

use tracing::debug;

use crate::protocol::{Message, PayloadSize, PipeliningError, RequestHeader};

pub type RequestHead = (RequestHeader, PayloadSize);

/// What to do with a frame offered to the [`PipeliningBuffer`].
#[derive(Debug)]
pub enum Admission {
    /// Hand the frame to the connection state machine.
    Forward(Message<RequestHead>),
    /// The frame was queued or swallowed.
    Buffered,
}

#[derive(Debug, Default)]
pub struct PipeliningBuffer {
    active: bool,
    pending: VecDeque<RequestHead>,
}

impl PipeliningBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn on_message(&mut self, message: Message<RequestHead>) -> Result<Admission, PipeliningError> {
        match message {
            Message::Header(head) if self.active => {
                debug!(uri = %head.0.uri(), pending = self.pending.len() + 1, "buffering pipelined request");
                self.pending.push_back(head);
                Ok(Admission::Buffered)
            }
            Message::Header(head) => {
                self.active = true;
                Ok(Admission::Forward(Message::Header(head)))
            }
            Message::Payload(item) if self.active && self.pending.is_empty() => {
                Ok(Admission::Forward(Message::Payload(item)))
            }
            // the EOF of a parked body-less request is replayed when it is released
            Message::Payload(item) if item.is_empty() => Ok(Admission::Buffered),
            Message::Payload(_) => Err(PipeliningError::BodyWhileBuffered),
        }
    }

    /// Finishes the active request and releases the oldest parked head, if any.
    ///
    /// The caller forwards the returned head followed by an empty final content event.
    pub fn on_response_complete(&mut self) -> Result<Option<RequestHead>, PipeliningError> {
        if !self.active {
            return Err(PipeliningError::ResponseWithoutRequest);
        }

        let next = self.pending.pop_front();
        self.active = next.is_some();
        Ok(next)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
