use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_REQUEST_HEADERS, CONNECTION,
};
use http::{HeaderValue, Method, Response, StatusCode, Version};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::connection::pipelining::{Admission, PipeliningBuffer, RequestHead};
use crate::connection::{ConnectionStats, HttpService};
use crate::dispatch::DispatchError;
use crate::exchange::{ContentReceiver, Exchange};
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseBody, ResponseHead, SendError,
    empty_response, status_response,
};

type ResponseMessage = Message<(ResponseHead, PayloadSize)>;
type ResponseReceiver = oneshot::Receiver<Response<ResponseBody>>;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// State of the request currently being answered. Dropping it releases the body buffer and any
/// spill file.
struct Cycle {
    exchange: Exchange,
    response: Option<ResponseReceiver>,
    receiver: Option<ContentReceiver>,
    body_complete: bool,
}

/// Drives one client connection: decodes requests, hands them to the dispatchers and writes
/// exactly one response per request, in request order.
///
/// The connection closes when the keep-alive budget is used up, when the client asks for it,
/// after any 400/507 rejection, on idle timeout, and on protocol errors.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    service: Arc<HttpService>,
    stats: Arc<ConnectionStats>,
    ssl: bool,
    trusted_proxy: bool,
    keep_alive: u32,
    pipelining: PipeliningBuffer,
    cycle: Option<Cycle>,
    replay: Option<RequestHead>,
    read_closed: bool,
    /// A malformed head that arrived behind unanswered requests, answered once they are.
    deferred_error: Option<ParseError>,
    last_activity: Instant,
    last_inbound: Option<Instant>,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, service: Arc<HttpService>, stats: Arc<ConnectionStats>, ssl: bool) -> Self {
        let keep_alive = service.config().max_keep_alive;
        let trusted_proxy = service.config().is_trusted_proxy(stats.remote().ip());
        stats.set_num_keep_alive(keep_alive);

        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), 8 * 1024),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            service,
            stats,
            ssl,
            trusted_proxy,
            keep_alive,
            pipelining: PipeliningBuffer::new(),
            cycle: None,
            replay: None,
            read_closed: false,
            deferred_error: None,
            last_activity: Instant::now(),
            last_inbound: None,
        }
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Serves requests until the connection closes.
    ///
    /// Returns `Err` for protocol violations (malformed requests, a body on a pipelined request)
    /// and I/O failures; a regular close is `Ok`.
    pub async fn process(mut self) -> Result<(), HttpError> {
        let result = self.serve().await;
        // releases the content receiver of an unfinished request
        self.cycle = None;
        debug!(remote = %self.stats.remote(), ok = result.is_ok(), "connection closed");
        result
    }

    async fn serve(&mut self) -> Result<(), HttpError> {
        loop {
            let idle_deadline = self.service.idle_timeout().map(|timeout| self.last_activity + timeout);

            let flow = select! {
                biased;

                response = next_response(&mut self.cycle) => self.on_response(response).await?,

                frame = self.framed_read.next(), if !self.read_closed => {
                    let started = Instant::now();
                    let flow = match frame {
                        Some(Ok(message)) => self.on_frame(message).await?,
                        Some(Err(e)) => match self.on_decode_error(e) {
                            Some(e) => return self.answer_decode_error(e).await,
                            None => Flow::Continue,
                        },
                        None => self.on_read_closed(),
                    };
                    self.stats.process_latency().add(started.elapsed());
                    flow
                }

                () = idle(idle_deadline) => self.on_idle(),
            };

            if flow == Flow::Close || self.drain_replay().await? == Flow::Close {
                return Ok(());
            }

            if self.read_closed && !self.awaits_response() {
                return match self.deferred_error.take() {
                    Some(e) => self.answer_decode_error(e).await,
                    None => Ok(()),
                };
            }
        }
    }

    async fn on_frame(&mut self, message: Message<RequestHead>) -> Result<Flow, HttpError> {
        let now = Instant::now();
        if let Some(last) = self.last_inbound.replace(now) {
            self.stats.inbound_latency().add(now - last);
        }
        self.last_activity = now;

        match self.pipelining.on_message(message) {
            Ok(Admission::Forward(Message::Header(head))) => self.on_request_head(head).await,
            Ok(Admission::Forward(Message::Payload(item))) => {
                let last = item.is_eof();
                self.on_content(item.into_bytes().unwrap_or_default(), last).await
            }
            Ok(Admission::Buffered) => Ok(Flow::Continue),
            Err(e) => {
                info!(remote = %self.stats.remote(), cause = %e, "tearing down connection");
                Err(e.into())
            }
        }
    }

    async fn on_request_head(&mut self, (header, _payload_size): RequestHead) -> Result<Flow, HttpError> {
        self.stats.reset_cycle();
        self.service.server_stats().count_request();
        self.cycle = None;
        self.stats.set_url(header.uri().to_string());
        debug!(method = %header.method(), uri = %header.uri(), remote = %self.stats.remote(), "request received");

        let remote_ip = self.remote_ip(&header);
        let (exchange, response) = Exchange::new(header, remote_ip, self.ssl);

        if self.service.gate().is_blocked(remote_ip) {
            self.service.server_stats().count_block();
            debug!(remote = %remote_ip, uri = %exchange.uri(), "blocked request");
            return Ok(Flow::Close);
        }

        if exchange.header().is_100_continue_expected() {
            let writer = self.framed_write.get_mut();
            writer.write_all(CONTINUE).await.map_err(SendError::io)?;
            writer.flush().await.map_err(SendError::io)?;
            debug!(uri = %exchange.uri(), "sent 100 continue");
        }

        let accepts_body = exchange.header().accepts_body();
        let bodyless = exchange.header().is_bodyless_method();
        let cycle = self.cycle.insert(Cycle { exchange, response: Some(response), receiver: None, body_complete: false });

        if accepts_body {
            match self.service.pipeline().pre_dispatch(&mut cycle.exchange) {
                Ok(true) => {
                    // a claimant answers through a responder it took, or not at all
                    drop(cycle.exchange.responder());
                    self.stats.set_url(format!("{} (pre-dispatched)", cycle.exchange.uri()));
                }
                Ok(false) => {
                    match ContentReceiver::for_request(cycle.exchange.header(), self.service.buffer_settings().clone()) {
                        Ok(receiver) => {
                            debug!(uri = %cycle.exchange.uri(), form = receiver.form().is_some(), "receiving request body");
                            cycle.receiver = Some(receiver);
                        }
                        Err(e) => return self.reject(e.status(), e.to_string()).await,
                    }
                }
                Err(e) => return self.fail(e).await,
            }
        } else if !bodyless {
            let message = format!("Cannot {} as method. Use GET, POST, PUT, HEAD, DELETE, OPTIONS", cycle.exchange.method());
            return self.reject(StatusCode::BAD_REQUEST, message).await;
        }

        Ok(Flow::Continue)
    }

    async fn on_content(&mut self, chunk: Bytes, last: bool) -> Result<Flow, HttpError> {
        let Some(cycle) = self.cycle.as_mut() else {
            return Ok(Flow::Continue);
        };
        if !chunk.is_empty() {
            self.service.server_stats().count_chunk();
        }
        if last {
            cycle.body_complete = true;
        }

        if let Some(handler) = cycle.exchange.content_handler_mut() {
            trace!(len = chunk.len(), last, "streaming chunk to content handler");
            if let Err(e) = handler.handle(chunk, last) {
                return self.fail(e).await;
            }
            return Ok(Flow::Continue);
        }

        if cycle.exchange.is_pre_dispatched() {
            if !chunk.is_empty() {
                debug!(len = chunk.len(), "discarding chunk of a pre-dispatched request without content handler");
            }
            return Ok(Flow::Continue);
        }

        if let Some(receiver) = cycle.receiver.as_mut() {
            let mut outcome = receiver.offer(&chunk, last);
            if outcome.is_ok() && !chunk.is_empty() {
                outcome = self.service.limits().check(receiver);
            }
            if let Err(e) = outcome {
                return self.reject(e.status(), e.to_string()).await;
            }
            if !last {
                return Ok(Flow::Continue);
            }
            if let Some(receiver) = cycle.receiver.take() {
                cycle.exchange.set_content(receiver);
            }
            return self.dispatch().await;
        }

        if !chunk.is_empty() {
            return self.reject(StatusCode::BAD_REQUEST, "Only POST or PUT may send a request body").await;
        }

        if last { self.dispatch().await } else { Ok(Flow::Continue) }
    }

    async fn dispatch(&mut self) -> Result<Flow, HttpError> {
        let Some(cycle) = self.cycle.as_mut() else {
            return Ok(Flow::Continue);
        };

        if self.service.config().cors_allow_all && cycle.exchange.header().is_preflight() {
            cycle.response = None;
            drop(cycle.exchange.responder());
            let response = preflight_response(cycle.exchange.header());
            return self.write_response(response, false).await;
        }

        debug!(uri = %cycle.exchange.uri(), "dispatching");
        let result = self.service.pipeline().dispatch(&mut cycle.exchange);
        // whoever claimed the request answered or took the responder; a leftover one is unanswered
        drop(cycle.exchange.responder());

        match result {
            Ok(()) => {
                self.stats.set_url(format!("{} (dispatched)", cycle.exchange.uri()));
                Ok(Flow::Continue)
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_response(
        &mut self,
        response: Result<Response<ResponseBody>, oneshot::error::RecvError>,
    ) -> Result<Flow, HttpError> {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.response = None;
        }
        match response {
            Ok(response) => self.write_response(response, false).await,
            Err(_closed) => self.fail("request was claimed but never answered".into()).await,
        }
    }

    /// Application failure: 500 with the error message, or a plain close once committed.
    async fn fail(&mut self, error: DispatchError) -> Result<Flow, HttpError> {
        let Some(cycle) = self.cycle.as_mut() else {
            return Ok(Flow::Close);
        };
        error!(uri = %cycle.exchange.uri(), remote = %cycle.exchange.remote_ip(), cause = %error, "request failed");

        cycle.response = None;
        drop(cycle.exchange.responder());
        if cycle.exchange.is_response_committed() {
            return Ok(Flow::Close);
        }
        self.write_response(status_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()), false).await
    }

    /// Policy violation: answers `status` with `connection: close` and closes.
    async fn reject(&mut self, status: StatusCode, message: impl Into<String>) -> Result<Flow, HttpError> {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.response = None;
            drop(cycle.exchange.responder());
            if cycle.exchange.is_response_committed() {
                return Ok(Flow::Close);
            }
        }
        if status.is_client_error() {
            self.service.server_stats().count_client_error();
        }

        let message = message.into();
        debug!(%status, reason = %message, remote = %self.stats.remote(), "rejecting request");
        self.write_response(status_response(status, message), true).await?;
        Ok(Flow::Close)
    }

    /// Returns the error when it can be answered right away. A malformed head queued behind
    /// requests still waiting for their response is held back until those are written.
    fn on_decode_error(&mut self, e: ParseError) -> Option<ParseError> {
        info!(remote = %self.stats.remote(), cause = %e, "can't decode request");
        let inside_body = self.cycle.as_ref().is_some_and(|cycle| !cycle.body_complete);
        if inside_body || !self.pipelining.is_active() {
            return Some(e);
        }

        debug!(remote = %self.stats.remote(), pending = self.pipelining.pending(), "answering malformed request after outstanding responses");
        self.read_closed = true;
        self.deferred_error = Some(e);
        None
    }

    async fn answer_decode_error(&mut self, e: ParseError) -> Result<(), HttpError> {
        // an answered cycle no longer owns the connection
        if self.cycle.as_ref().is_some_and(|cycle| cycle.exchange.is_response_completed()) {
            self.cycle = None;
        }
        let committed = self.cycle.as_ref().is_some_and(|cycle| cycle.exchange.is_response_committed());
        if !committed {
            self.reject(StatusCode::BAD_REQUEST, format!("Bad request: {e}")).await?;
        }
        Err(e.into())
    }

    fn on_read_closed(&mut self) -> Flow {
        if self.awaits_response() {
            debug!(remote = %self.stats.remote(), "peer stopped sending, finishing outstanding responses");
            self.read_closed = true;
            Flow::Continue
        } else {
            Flow::Close
        }
    }

    fn on_idle(&mut self) -> Flow {
        match self.cycle.as_ref() {
            Some(cycle) if cycle.exchange.is_long_call() && !cycle.exchange.is_response_completed() => {
                trace!(uri = %cycle.exchange.uri(), "idle during long running request");
                self.last_activity = Instant::now();
                Flow::Continue
            }
            Some(cycle) if !cycle.exchange.is_response_completed() => {
                self.service.server_stats().count_idle_timeout();
                debug!(uri = %cycle.exchange.uri(), remote = %self.stats.remote(), "idle timeout during request");
                Flow::Close
            }
            _ => {
                debug!(remote = %self.stats.remote(), "closing idle connection");
                Flow::Close
            }
        }
    }

    /// Processes pipelined heads released by the last response, each with its empty final content.
    async fn drain_replay(&mut self) -> Result<Flow, HttpError> {
        while let Some(head) = self.replay.take() {
            if self.on_request_head(head).await? == Flow::Close {
                return Ok(Flow::Close);
            }
            if self.on_content(Bytes::new(), true).await? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    fn awaits_response(&self) -> bool {
        self.pipelining.pending() > 0
            || self.cycle.as_ref().is_some_and(|cycle| cycle.body_complete && !cycle.exchange.is_response_completed())
    }

    /// The peer address, or the first `X-Forwarded-For` entry when the peer is a trusted proxy.
    fn remote_ip(&self, header: &RequestHeader) -> IpAddr {
        let peer = self.stats.remote().ip();
        if !self.trusted_proxy {
            return peer;
        }
        header
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').find_map(|ip| ip.trim().parse::<IpAddr>().ok()))
            .unwrap_or(peer)
    }

    /// Uses up one keep-alive and tells whether another request may follow.
    fn consume_keep_alive(&mut self) -> bool {
        if !self.trusted_proxy {
            self.keep_alive = self.keep_alive.saturating_sub(1);
            self.stats.set_num_keep_alive(self.keep_alive);
        }
        self.keep_alive > 0
    }

    async fn write_response(&mut self, mut response: Response<ResponseBody>, force_close: bool) -> Result<Flow, HttpError> {
        let (wants_keep_alive, is_head, is_http_10) = match self.cycle.as_ref() {
            Some(cycle) => {
                let header = cycle.exchange.header();
                (
                    cycle.body_complete && header.wants_keep_alive(),
                    header.method() == Method::HEAD,
                    header.version() == Version::HTTP_10,
                )
            }
            None => (false, false, false),
        };
        let keep_alive = self.consume_keep_alive() && wants_keep_alive && !force_close && !asks_close(&response);

        if !keep_alive {
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        } else if is_http_10 {
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        if is_head {
            *response.body_mut() = ResponseBody::empty();
        }
        *response.version_mut() = Version::HTTP_11;

        if let Some(cycle) = self.cycle.as_mut() {
            cycle.exchange.set_committed();
            self.stats.set_url(format!("{} (committed)", cycle.exchange.uri()));
        }

        self.do_send_response(response).await?;

        if let Some(cycle) = self.cycle.as_mut() {
            cycle.exchange.set_completed();
            self.stats.set_url(format!("{} (completed)", cycle.exchange.uri()));
        }
        self.last_activity = Instant::now();

        if !keep_alive {
            debug!(remote = %self.stats.remote(), keep_alive = self.keep_alive, "closing connection after response");
            return Ok(Flow::Close);
        }

        self.replay = self.pipelining.on_response_complete()?;
        Ok(Flow::Continue)
    }

    async fn do_send_response(&mut self, response: Response<ResponseBody>) -> Result<(), HttpError> {
        let (header_parts, mut body) = response.into_parts();

        let payload_size = match body.size_hint().exact() {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        };

        let header = ResponseMessage::Header((ResponseHead::from_parts(header_parts, ()), payload_size));
        self.framed_write.feed(header).await?;

        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    // trailers are not written
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    self.framed_write.feed(ResponseMessage::Payload(PayloadItem::Chunk(data))).await?;
                }
                Some(Err(e)) => return Err(SendError::invalid_body(format!("resolve response body error: {e}")).into()),
                None => {
                    // send flushes the head and everything fed so far
                    self.framed_write.send(ResponseMessage::Payload(PayloadItem::Eof)).await?;
                    return Ok(());
                }
            }
        }
    }
}

impl<R, W> std::fmt::Debug for HttpConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("remote", &self.stats.remote())
            .field("keep_alive", &self.keep_alive)
            .field("pipelining", &self.pipelining)
            .finish_non_exhaustive()
    }
}

async fn next_response(cycle: &mut Option<Cycle>) -> Result<Response<ResponseBody>, oneshot::error::RecvError> {
    match cycle.as_mut().and_then(|cycle| cycle.response.as_mut()) {
        Some(receiver) => receiver.await,
        None => std::future::pending().await,
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn asks_close(response: &Response<ResponseBody>) -> bool {
    response.headers().get(CONNECTION).is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"close"))
}

fn preflight_response(header: &RequestHeader) -> Response<ResponseBody> {
    let allow_headers =
        header.headers().get(ACCESS_CONTROL_REQUEST_HEADERS).cloned().unwrap_or_else(|| HeaderValue::from_static(""));

    let mut response = empty_response(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET,PUT,POST,DELETE"));
    headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressRange, HttpConfig};
    use crate::connection::ServerStats;
    use crate::dispatch::{DispatchDecision, Dispatcher, DispatcherPipeline, MockDispatcher};
    use crate::exchange::{MockSpaceProbe, Responder};
    use crate::firewall::MockFirewall;
    use indoc::indoc;
    use mockall::predicate::eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    /// Answers `"<method> <path>"`, followed by the form fields or the body size.
    struct Echo;

    impl Dispatcher for Echo {
        fn priority(&self) -> u32 {
            100
        }

        fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
            let mut text = format!("{} {}", exchange.method(), exchange.path());
            if let Some(content) = exchange.content() {
                match content.form().and_then(|form| form.fields()) {
                    Some(fields) => fields.iter().for_each(|(name, value)| text.push_str(&format!(" {name}={value}"))),
                    None => text.push_str(&format!(" {} bytes", content.len())),
                }
            }
            exchange.respond(status_response(StatusCode::OK, text));
            Ok(DispatchDecision::Done)
        }
    }

    /// Answers from another task after a short delay.
    struct Deferred;

    impl Dispatcher for Deferred {
        fn priority(&self) -> u32 {
            100
        }

        fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
            let responder = exchange.responder().unwrap();
            let text = format!("deferred {}", exchange.path());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                responder.send(status_response(StatusCode::OK, text));
            });
            Ok(DispatchDecision::Done)
        }
    }

    /// Keeps responders around until the test answers them.
    #[derive(Default)]
    struct Parked {
        responders: Arc<Mutex<Vec<Responder>>>,
        long_call: bool,
    }

    impl Dispatcher for Parked {
        fn priority(&self) -> u32 {
            100
        }

        fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
            if self.long_call {
                exchange.mark_long_call();
            }
            self.responders.lock().unwrap().extend(exchange.responder());
            Ok(DispatchDecision::Done)
        }
    }

    /// Claims `/stream` uploads up front and answers once the last chunk is in.
    #[derive(Default)]
    struct Streaming {
        received: Arc<Mutex<Vec<u8>>>,
    }

    impl Dispatcher for Streaming {
        fn priority(&self) -> u32 {
            10
        }

        fn pre_dispatch(&self, exchange: &mut Exchange) -> Result<bool, DispatchError> {
            if exchange.path() != "/stream" {
                return Ok(false);
            }
            let received = Arc::clone(&self.received);
            let mut responder = exchange.responder();
            exchange.set_content_handler(Box::new(move |chunk: Bytes, last: bool| -> Result<(), DispatchError> {
                let mut received = received.lock().unwrap();
                received.extend_from_slice(&chunk);
                if last && let Some(responder) = responder.take() {
                    responder.send(status_response(StatusCode::OK, format!("{} bytes streamed", received.len())));
                }
                Ok(())
            }));
            Ok(true)
        }

        fn dispatch(&self, _exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
            Ok(DispatchDecision::Continue)
        }
    }

    struct Harness {
        client: DuplexStream,
        buffered: Vec<u8>,
        server: JoinHandle<Result<(), HttpError>>,
        stats: Arc<ConnectionStats>,
        server_stats: Arc<ServerStats>,
    }

    impl Harness {
        fn start(service: HttpService) -> Self {
            Self::start_from(service, "10.0.0.1:50000")
        }

        fn start_from(service: HttpService, remote: &str) -> Self {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(server);
            let server_stats = Arc::clone(service.server_stats());
            let stats = Arc::new(ConnectionStats::new(remote.parse().unwrap()));
            let connection = HttpConnection::new(reader, writer, Arc::new(service), Arc::clone(&stats), false);
            let server = tokio::spawn(connection.process());
            Self { client, buffered: vec![], server, stats, server_stats }
        }

        async fn send(&mut self, request: &str) {
            self.client.write_all(request.as_bytes()).await.unwrap();
        }

        async fn read_response(&mut self) -> String {
            loop {
                if let Some(len) = response_len(&self.buffered) {
                    let rest = self.buffered.split_off(len);
                    let response = std::mem::replace(&mut self.buffered, rest);
                    return String::from_utf8(response).unwrap();
                }
                let mut chunk = [0u8; 1024];
                let n = self.client.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed mid-response: {}", String::from_utf8_lossy(&self.buffered));
                self.buffered.extend_from_slice(&chunk[..n]);
            }
        }

        /// Stops sending, then collects everything until the server hangs up.
        async fn finish(&mut self) -> (String, Result<(), HttpError>) {
            let _ = self.client.shutdown().await;
            self.client.read_to_end(&mut self.buffered).await.unwrap();
            let result = (&mut self.server).await.unwrap();
            (String::from_utf8(std::mem::take(&mut self.buffered)).unwrap(), result)
        }
    }

    /// Request fixtures are written with plain newlines.
    fn crlf(text: &str) -> String {
        text.replace('\n', "\r\n")
    }

    fn response_len(buf: &[u8]) -> Option<usize> {
        let head_end = buf.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
        let head = std::str::from_utf8(&buf[..head_end]).ok()?;
        let body = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length: "))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        (buf.len() >= head_end + body).then_some(head_end + body)
    }

    fn service_with<D: Dispatcher + 'static>(config: HttpConfig, dispatcher: D) -> HttpService {
        HttpService::new(config, DispatcherPipeline::builder().register(dispatcher).build())
    }

    fn echo(config: HttpConfig) -> HttpService {
        service_with(config, Echo)
    }

    fn ranges(ranges: &[&str]) -> Vec<AddressRange> {
        ranges.iter().map(|range| range.parse().unwrap()).collect()
    }

    fn mock_dispatcher() -> MockDispatcher {
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_priority().return_const(100u32);
        dispatcher
    }

    #[tokio::test]
    async fn keeps_connection_alive_between_requests() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("GET /a HTTP/1.1\r\nHost: test\r\n\r\n").await;
        let first = harness.read_response().await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{first}");
        assert!(first.ends_with("GET /a"));
        assert!(!first.contains("connection: close"));

        harness.send("GET /b HTTP/1.1\r\nHost: test\r\n\r\n").await;
        assert!(harness.read_response().await.ends_with("GET /b"));

        let (rest, result) = harness.finish().await;
        assert!(result.is_ok());
        assert!(rest.is_empty());
        assert_eq!(harness.server_stats.requests(), 2);
        assert_eq!(harness.stats.num_keep_alive(), 98);
        assert_eq!(*harness.stats.url(), "/b (completed)");
    }

    #[tokio::test]
    async fn keep_alive_budget_closes_connection() {
        let config = HttpConfig { max_keep_alive: 2, ..Default::default() };
        let mut harness = Harness::start(echo(config));

        harness.send("GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n").await;
        let (output, result) = harness.finish().await;

        assert!(result.is_ok());
        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(output.matches("connection: close").count(), 1);
        assert!(output.ends_with("GET /2"));
        assert!(!output.contains("GET /3"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let mut harness = Harness::start(service_with(HttpConfig::default(), Deferred));

        harness.send("GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n").await;
        let (output, result) = harness.finish().await;

        assert!(result.is_ok());
        let positions: Vec<_> =
            ["deferred /1", "deferred /2", "deferred /3"].iter().map(|text| output.find(text).unwrap()).collect();
        assert!(positions.is_sorted(), "{output}");
        assert_eq!(harness.server_stats.requests(), 3);
    }

    #[tokio::test]
    async fn body_on_pipelined_request_tears_down_connection() {
        let parked = Parked::default();
        let responders = Arc::clone(&parked.responders);
        let mut harness = Harness::start(service_with(HttpConfig::default(), parked));

        harness.send("GET /1 HTTP/1.1\r\n\r\nPOST /2 HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody").await;
        let (output, result) = harness.finish().await;

        assert!(output.is_empty());
        assert!(matches!(result, Err(HttpError::PipeliningError { source: crate::protocol::PipeliningError::BodyWhileBuffered })));
        assert_eq!(responders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blocked_address_gets_no_response() {
        let config = HttpConfig { ip_filter: ranges(&["10.0.0.0/8"]), ..Default::default() };
        let mut harness = Harness::start(echo(config));

        harness.send("GET / HTTP/1.1\r\n\r\n").await;
        let (output, result) = harness.finish().await;

        assert!(result.is_ok());
        assert!(output.is_empty());
        assert_eq!(harness.server_stats.blocks(), 1);
    }

    #[tokio::test]
    async fn firewall_sees_forwarded_address_of_trusted_proxy() {
        let client: IpAddr = "203.0.113.7".parse().unwrap();
        let mut firewall = MockFirewall::new();
        firewall.expect_is_blacklisted().with(eq(client)).times(1).return_const(true);

        let config = HttpConfig { proxy_ips: ranges(&["10.0.0.1"]), ..Default::default() };
        let service = echo(config).with_firewall(Arc::new(firewall));
        let mut harness = Harness::start(service);

        harness.send("GET / HTTP/1.1\r\nX-Forwarded-For: garbage, 203.0.113.7, 10.0.0.1\r\n\r\n").await;
        let (output, _) = harness.finish().await;

        assert!(output.is_empty());
        assert_eq!(harness.server_stats.blocks(), 1);
    }

    #[tokio::test]
    async fn forwarded_header_is_ignored_from_untrusted_peers() {
        let mut firewall = MockFirewall::new();
        firewall.expect_is_blacklisted().with(eq("10.0.0.1".parse::<IpAddr>().unwrap())).return_const(false);

        let mut harness = Harness::start(echo(HttpConfig::default()).with_firewall(Arc::new(firewall)));
        harness.send("GET /x HTTP/1.1\r\nX-Forwarded-For: 203.0.113.7\r\n\r\n").await;

        assert!(harness.read_response().await.ends_with("GET /x"));
    }

    #[tokio::test]
    async fn trusted_proxy_does_not_use_up_keep_alive() {
        let config = HttpConfig { max_keep_alive: 1, proxy_ips: ranges(&["10.0.0.0/24"]), ..Default::default() };
        let mut harness = Harness::start(echo(config));

        for path in ["/1", "/2", "/3"] {
            harness.send(&format!("GET {path} HTTP/1.1\r\n\r\n")).await;
            let response = harness.read_response().await;
            assert!(!response.contains("connection: close"), "{response}");
        }
        assert_eq!(harness.stats.num_keep_alive(), 1);
        assert!(harness.finish().await.1.is_ok());
    }

    #[tokio::test]
    async fn upload_over_the_limit_is_rejected() {
        let mut dispatcher = mock_dispatcher();
        dispatcher.expect_pre_dispatch().returning(|_| Ok(false));
        dispatcher.expect_dispatch().times(0);

        let config = HttpConfig { max_upload_size: 10, ..Default::default() };
        let mut harness = Harness::start(service_with(config, dispatcher));

        harness.send("POST /up HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world").await;
        let (output, result) = harness.finish().await;

        assert!(result.is_ok());
        assert!(output.starts_with("HTTP/1.1 507 Insufficient Storage\r\n"), "{output}");
        assert!(output.contains("connection: close"));
        assert!(output.ends_with("The uploaded file exceeds the maximal upload size of 10 bytes"));
        assert_eq!(harness.server_stats.client_errors(), 0);
    }

    #[tokio::test]
    async fn upload_at_the_limit_is_accepted() {
        let config = HttpConfig { max_upload_size: 10, ..Default::default() };
        let mut harness = Harness::start(echo(config));

        harness.send("POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\nhelloworld").await;

        assert!(harness.read_response().await.ends_with("POST /up 10 bytes"));
    }

    #[tokio::test]
    async fn spilled_upload_needs_free_space() {
        let mut probe = MockSpaceProbe::new();
        probe.expect_available_space().returning(|_| Ok(10));

        let config = HttpConfig { min_upload_free_space: 1000, upload_memory_threshold: 4, ..Default::default() };
        let mut harness = Harness::start(echo(config).with_space_probe(Arc::new(probe)));

        harness.send("POST /up HTTP/1.1\r\nContent-Length: 8\r\n\r\n12345678").await;
        let (output, _) = harness.finish().await;

        assert!(output.starts_with("HTTP/1.1 507 Insufficient Storage\r\n"), "{output}");
        assert!(output.ends_with("The web server is running out of temporary space to store the upload"));
    }

    #[tokio::test]
    async fn pre_dispatched_body_streams_to_content_handler() {
        let streaming = Streaming::default();
        let received = Arc::clone(&streaming.received);
        let pipeline = DispatcherPipeline::builder().register(streaming).register(Echo).build();
        let mut harness = Harness::start(HttpService::new(HttpConfig::default(), pipeline));

        harness
            .send("POST /stream HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n")
            .await;
        let response = harness.read_response().await;

        assert!(response.ends_with("9 bytes streamed"), "{response}");
        assert_eq!(received.lock().unwrap().as_slice(), b"wikipedia");
        assert_eq!(*harness.stats.url(), "/stream (completed)");

        harness.send("POST /other HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await;
        assert!(harness.read_response().await.ends_with("POST /other 3 bytes"));
    }

    #[tokio::test]
    async fn pre_dispatch_is_offered_once() {
        let mut dispatcher = mock_dispatcher();
        dispatcher.expect_pre_dispatch().times(1).returning(|_| Ok(false));
        dispatcher.expect_dispatch().times(1).returning(|exchange| {
            exchange.respond(status_response(StatusCode::OK, "ok"));
            Ok(DispatchDecision::Done)
        });
        let mut harness = Harness::start(service_with(HttpConfig::default(), dispatcher));

        harness.send("POST /form HTTP/1.1\r\nContent-Length: 6\r\n\r\n").await;
        harness.send("ab").await;
        harness.send("cdef").await;

        assert!(harness.read_response().await.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn expect_continue_is_acknowledged() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("POST /up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n").await;
        assert_eq!(harness.read_response().await, "HTTP/1.1 100 Continue\r\n\r\n");

        harness.send("hello").await;
        assert!(harness.read_response().await.ends_with("POST /up 5 bytes"));
    }

    #[tokio::test]
    async fn cors_preflight_is_answered_directly() {
        let mut dispatcher = mock_dispatcher();
        dispatcher.expect_dispatch().times(0);

        let config = HttpConfig { cors_allow_all: true, ..Default::default() };
        let mut harness = Harness::start(service_with(config, dispatcher));

        harness
            .send(&crlf(indoc! {"
                OPTIONS /api HTTP/1.1
                Access-Control-Request-Method: PUT
                Access-Control-Request-Headers: x-token

            "}))
            .await;
        let response = harness.read_response().await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("access-control-allow-methods: GET,PUT,POST,DELETE\r\n"));
        assert!(response.contains("access-control-allow-credentials: true\r\n"));
        assert!(response.contains("access-control-allow-headers: x-token\r\n"));
        assert!(response.contains("content-length: 0\r\n"));
    }

    #[tokio::test]
    async fn plain_options_request_is_dispatched() {
        let config = HttpConfig { cors_allow_all: true, ..Default::default() };
        let mut harness = Harness::start(echo(config));

        harness.send("OPTIONS /api HTTP/1.1\r\n\r\n").await;

        assert!(harness.read_response().await.ends_with("OPTIONS /api"));
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("PATCH /doc HTTP/1.1\r\n\r\n").await;
        let (output, result) = harness.finish().await;

        assert!(result.is_ok());
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");
        assert!(output.contains("connection: close"));
        assert!(output.ends_with("Cannot PATCH as method. Use GET, POST, PUT, HEAD, DELETE, OPTIONS"));
        assert_eq!(harness.server_stats.client_errors(), 1);
    }

    #[tokio::test]
    async fn body_on_get_is_rejected() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("GET /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await;
        let (output, _) = harness.finish().await;

        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");
        assert!(output.ends_with("Only POST or PUT may send a request body"));
    }

    #[tokio::test]
    async fn malformed_request_is_answered_with_400() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("GARBAGE\r\n\r\n").await;
        let response = harness.read_response().await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        assert!(response.contains("connection: close\r\n"));
        assert!(response.contains("Bad request: invalid header"), "{response}");

        let (rest, result) = harness.finish().await;
        assert!(rest.is_empty());
        assert!(matches!(result, Err(HttpError::RequestError { .. })));
    }

    #[tokio::test]
    async fn malformed_head_after_answered_request_gets_400() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("GET /a HTTP/1.1\r\n\r\n").await;
        assert!(harness.read_response().await.ends_with("GET /a"));

        harness.send("GARBAGE\r\n\r\n").await;
        let response = harness.read_response().await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

        let (rest, result) = harness.finish().await;
        assert!(rest.is_empty());
        assert!(result.is_err());
        assert_eq!(harness.server_stats.client_errors(), 1);
    }

    #[tokio::test]
    async fn malformed_pipelined_head_is_answered_after_earlier_request() {
        let parked = Parked::default();
        let responders = Arc::clone(&parked.responders);
        let mut harness = Harness::start(service_with(HttpConfig::default(), parked));

        harness.send("GET /1 HTTP/1.1\r\n\r\nGARBAGE\r\n\r\n").await;
        let responder = loop {
            if let Some(responder) = responders.lock().unwrap().pop() {
                break responder;
            }
            tokio::task::yield_now().await;
        };
        assert!(responder.send(status_response(StatusCode::OK, "first")));

        let first = harness.read_response().await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{first}");
        assert!(first.ends_with("first"));
        let second = harness.read_response().await;
        assert!(second.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{second}");

        let (rest, result) = harness.finish().await;
        assert!(rest.is_empty());
        assert!(matches!(result, Err(HttpError::RequestError { .. })));
    }

    #[tokio::test]
    async fn dispatcher_error_becomes_500() {
        let mut dispatcher = mock_dispatcher();
        dispatcher.expect_dispatch().returning(|_| Err("database offline".into()));
        let mut harness = Harness::start(service_with(HttpConfig::default(), dispatcher));

        harness.send("GET /x HTTP/1.1\r\n\r\n").await;
        let response = harness.read_response().await;

        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        assert!(response.ends_with("database offline"));
        assert!(!response.contains("connection: close"));
    }

    #[tokio::test]
    async fn claimed_but_unanswered_request_becomes_500() {
        let mut dispatcher = mock_dispatcher();
        dispatcher.expect_dispatch().returning(|_| Ok(DispatchDecision::Done));
        let mut harness = Harness::start(service_with(HttpConfig::default(), dispatcher));

        harness.send("GET /x HTTP/1.1\r\n\r\n").await;
        let response = harness.read_response().await;

        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        assert!(response.ends_with("request was claimed but never answered"));
    }

    #[tokio::test]
    async fn url_encoded_form_is_decoded() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness
            .send(&crlf(indoc! {"
                POST /form HTTP/1.1
                Content-Type: application/x-www-form-urlencoded
                Content-Length: 22

            "}))
            .await;
        harness.send("name=conduit&lang=rust").await;

        assert!(harness.read_response().await.ends_with("POST /form name=conduit lang=rust"));
    }

    #[tokio::test]
    async fn multipart_without_boundary_is_rejected() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("POST /form HTTP/1.1\r\nContent-Type: multipart/form-data\r\nContent-Length: 2\r\n\r\nab").await;
        let (output, _) = harness.finish().await;

        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");
        assert!(output.contains("connection: close"));
    }

    #[tokio::test]
    async fn http_10_closes_unless_asked_to_keep_alive() {
        let mut harness = Harness::start(echo(HttpConfig::default()));
        harness.send("GET /old HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await;
        let response = harness.read_response().await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connection: keep-alive\r\n"));

        harness.send("GET /old HTTP/1.0\r\n\r\n").await;
        let response = harness.read_response().await;
        assert!(response.contains("connection: close\r\n"));
        assert!((&mut harness.server).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let mut harness = Harness::start(echo(HttpConfig::default()));

        harness.send("HEAD /x HTTP/1.1\r\n\r\n").await;
        let response = harness.read_response().await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 0\r\n"));
        assert!(!response.contains("HEAD /x"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed() {
        let config = HttpConfig { idle_timeout_secs: 5, ..Default::default() };
        let mut harness = Harness::start(echo(config));

        assert!((&mut harness.server).await.unwrap().is_ok());
        assert_eq!(harness.server_stats.idle_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_counts_as_idle_timeout() {
        let config = HttpConfig { idle_timeout_secs: 5, ..Default::default() };
        let mut harness = Harness::start(echo(config));

        harness.send("POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").await;

        assert!((&mut harness.server).await.unwrap().is_ok());
        assert_eq!(harness.server_stats.idle_timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_call_survives_idle_timeout() {
        let parked = Parked { long_call: true, ..Default::default() };
        let responders = Arc::clone(&parked.responders);
        let config = HttpConfig { idle_timeout_secs: 5, ..Default::default() };
        let mut harness = Harness::start(service_with(config, parked));

        harness.send("GET /slow HTTP/1.1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!harness.server.is_finished());

        let responder = responders.lock().unwrap().pop().unwrap();
        responder.send(status_response(StatusCode::OK, "finally"));
        assert!(harness.read_response().await.ends_with("finally"));

        assert!((&mut harness.server).await.unwrap().is_ok());
        assert_eq!(harness.server_stats.idle_timeouts(), 0);
    }
}
