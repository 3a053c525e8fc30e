//! Priority-ordered request dispatchers.
//!
//! Each request is offered to the registered [`Dispatcher`]s in ascending priority order, at
//! most twice: once through [`pre_dispatch`](Dispatcher::pre_dispatch) before a POST/PUT body
//! arrives, and once through [`dispatch`](Dispatcher::dispatch) when the body is complete. The
//! first dispatcher to claim it owns the response; nothing is offered again after that.
//!
//! [`NotFoundDispatcher`] always sits at the tail, so every request is claimed by someone.

use std::fmt;

use http::StatusCode;
use tracing::debug;

use crate::exchange::Exchange;
use crate::protocol::{BoxError, status_response};

/// Failure raised by a dispatcher or a streaming content handler.
pub type DispatchError = BoxError;

/// Priority of [`NotFoundDispatcher`]; user dispatchers should stay below it.
pub const NOT_FOUND_PRIORITY: u32 = 999;

/// Outcome of [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// The request is claimed and this dispatcher produces its response.
    Done,
    /// Not interested; offer it to the next dispatcher.
    Continue,
}

#[cfg_attr(test, mockall::automock)]
pub trait Dispatcher: Send + Sync {
    /// Lower values are asked first.
    fn priority(&self) -> u32;

    /// Claims a POST/PUT request before its body arrives.
    ///
    /// A claiming dispatcher usually installs a content handler with
    /// [`Exchange::set_content_handler`] and takes the responder to answer once the body is in.
    fn pre_dispatch(&self, _exchange: &mut Exchange) -> Result<bool, DispatchError> {
        Ok(false)
    }

    fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError>;
}

/// Answers every request with `404 Not Found`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundDispatcher;

impl Dispatcher for NotFoundDispatcher {
    fn priority(&self) -> u32 {
        NOT_FOUND_PRIORITY
    }

    fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
        let message = format!("No dispatcher found for: {}", exchange.path());
        exchange.respond(status_response(StatusCode::NOT_FOUND, message));
        Ok(DispatchDecision::Done)
    }
}

/// The sorted, immutable dispatcher list shared by all connections.
pub struct DispatcherPipeline {
    dispatchers: Vec<Box<dyn Dispatcher>>,
}

impl DispatcherPipeline {
    pub fn builder() -> DispatcherPipelineBuilder {
        DispatcherPipelineBuilder { dispatchers: vec![] }
    }

    /// Offers the request for early claiming. Returns whether someone claimed it.
    pub fn pre_dispatch(&self, exchange: &mut Exchange) -> Result<bool, DispatchError> {
        for dispatcher in &self.dispatchers {
            if dispatcher.pre_dispatch(exchange)? {
                debug!(priority = dispatcher.priority(), uri = %exchange.uri(), "request pre-dispatched");
                exchange.set_pre_dispatched();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Offers the completed request until one dispatcher answers [`DispatchDecision::Done`].
    pub fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError> {
        for dispatcher in &self.dispatchers {
            if dispatcher.dispatch(exchange)? == DispatchDecision::Done {
                debug!(priority = dispatcher.priority(), uri = %exchange.uri(), "request dispatched");
                exchange.set_dispatched();
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn priorities(&self) -> impl Iterator<Item = u32> + '_ {
        self.dispatchers.iter().map(|dispatcher| dispatcher.priority())
    }
}

impl Default for DispatcherPipeline {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for DispatcherPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherPipeline").field("priorities", &self.priorities().collect::<Vec<_>>()).finish()
    }
}

pub struct DispatcherPipelineBuilder {
    dispatchers: Vec<Box<dyn Dispatcher>>,
}

impl DispatcherPipelineBuilder {
    pub fn register<D: Dispatcher + 'static>(self, dispatcher: D) -> Self {
        self.register_boxed(Box::new(dispatcher))
    }

    pub fn register_boxed(mut self, dispatcher: Box<dyn Dispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Sorts once by priority, keeping registration order for ties, and appends the 404 fallback.
    pub fn build(mut self) -> DispatcherPipeline {
        self.dispatchers.sort_by_key(|dispatcher| dispatcher.priority());
        self.dispatchers.push(Box::new(NotFoundDispatcher));
        DispatcherPipeline { dispatchers: self.dispatchers }
    }
}

impl fmt::Debug for DispatcherPipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherPipelineBuilder").field("registered", &self.dispatchers.len()).finish()
    }
}
