//! The per-request record handed to dispatchers.
//!
//! An [`Exchange`] is created when a request head arrives and dropped when the next head
//! arrives or the connection goes away, taking its buffered body (and any spill file) with it.
//! Dispatchers answer through it, either synchronously with [`Exchange::respond`] or later by
//! taking the single-use [`Responder`] to another task.

mod content;

pub use content::BodyBuffer;
pub use content::BufferSettings;
pub use content::ContentError;
pub use content::ContentReceiver;
pub use content::FormDecoder;
pub use content::FsSpaceProbe;
pub use content::SpaceProbe;
pub use content::UploadLimits;

#[cfg(test)]
pub(crate) use content::MockSpaceProbe;

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use http::{Method, Response, Uri};
use tokio::sync::oneshot;
use tracing::debug;

use crate::dispatch::DispatchError;
use crate::protocol::{RequestHeader, ResponseBody};

/// Receives the body of a request claimed before its body arrived.
///
/// Chunks arrive in order; the final call has `last == true` and may carry an empty chunk.
pub trait ContentHandler: Send + Sync {
    fn handle(&mut self, chunk: Bytes, last: bool) -> Result<(), DispatchError>;
}

impl<F> ContentHandler for F
where
    F: FnMut(Bytes, bool) -> Result<(), DispatchError> + Send + Sync,
{
    fn handle(&mut self, chunk: Bytes, last: bool) -> Result<(), DispatchError> {
        self(chunk, last)
    }
}

/// Sends the one response of a request cycle back to its connection.
///
/// Dropping it unanswered makes the connection answer `500 Internal Server Error`.
#[derive(Debug)]
pub struct Responder {
    sender: oneshot::Sender<Response<ResponseBody>>,
}

impl Responder {
    /// Returns `false` when the connection is already gone.
    pub fn send(self, response: Response<ResponseBody>) -> bool {
        match self.sender.send(response) {
            Ok(()) => true,
            Err(_response) => {
                debug!("connection closed before the response was ready");
                false
            }
        }
    }
}

pub struct Exchange {
    header: RequestHeader,
    remote_ip: IpAddr,
    ssl: bool,
    responder: Option<Responder>,
    content_handler: Option<Box<dyn ContentHandler>>,
    content: Option<ContentReceiver>,
    pre_dispatched: bool,
    dispatched: bool,
    long_call: bool,
    committed: bool,
    completed: bool,
}

impl Exchange {
    /// Creates the exchange of a new request cycle plus the receiving end of its responder.
    pub fn new(header: RequestHeader, remote_ip: IpAddr, ssl: bool) -> (Self, oneshot::Receiver<Response<ResponseBody>>) {
        let (sender, receiver) = oneshot::channel();
        let exchange = Self {
            header,
            remote_ip,
            ssl,
            responder: Some(Responder { sender }),
            content_handler: None,
            content: None,
            pre_dispatched: false,
            dispatched: false,
            long_call: false,
            committed: false,
            completed: false,
        };
        (exchange, receiver)
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn path(&self) -> &str {
        self.header.uri().path()
    }

    /// The client address, resolved through `X-Forwarded-For` when the peer is a trusted proxy.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    pub fn is_pre_dispatched(&self) -> bool {
        self.pre_dispatched
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Answers the request. Returns `false` if the responder was already used or taken.
    pub fn respond(&mut self, response: Response<ResponseBody>) -> bool {
        self.responder.take().is_some_and(|responder| responder.send(response))
    }

    /// Takes the responder to answer from elsewhere, e.g. a spawned task.
    pub fn responder(&mut self) -> Option<Responder> {
        self.responder.take()
    }

    pub fn has_responder(&self) -> bool {
        self.responder.is_some()
    }

    /// Routes the remaining body chunks of a pre-dispatched request to `handler`.
    pub fn set_content_handler(&mut self, handler: Box<dyn ContentHandler>) {
        self.content_handler = Some(handler);
    }

    /// The completed body, when the request carried one and was not streamed to a handler.
    pub fn content(&self) -> Option<&ContentReceiver> {
        self.content.as_ref()
    }

    pub fn take_content(&mut self) -> Option<ContentReceiver> {
        self.content.take()
    }

    /// Keeps the idle timeout from closing the connection while this cycle is in progress.
    pub fn mark_long_call(&mut self) {
        self.long_call = true;
    }

    pub fn is_long_call(&self) -> bool {
        self.long_call
    }

    pub fn is_response_committed(&self) -> bool {
        self.committed
    }

    pub fn is_response_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn content_handler_mut(&mut self) -> Option<&mut Box<dyn ContentHandler>> {
        self.content_handler.as_mut()
    }

    pub(crate) fn has_content_handler(&self) -> bool {
        self.content_handler.is_some()
    }

    pub(crate) fn set_content(&mut self, content: ContentReceiver) {
        self.content = Some(content);
    }

    pub(crate) fn set_pre_dispatched(&mut self) {
        self.pre_dispatched = true;
    }

    pub(crate) fn set_dispatched(&mut self) {
        self.dispatched = true;
    }

    pub(crate) fn set_committed(&mut self) {
        self.committed = true;
    }

    pub(crate) fn set_completed(&mut self) {
        self.completed = true;
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("remote_ip", &self.remote_ip)
            .field("pre_dispatched", &self.pre_dispatched)
            .field("dispatched", &self.dispatched)
            .field("committed", &self.committed)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}
