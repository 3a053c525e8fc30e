//! HTTP request head handling.
//!
//! [`RequestHeader`] wraps `http::Request<()>` and adds the few protocol questions the
//! connection state machine asks about a head: does it expect `100-continue`, is it a CORS
//! preflight, may the connection be reused afterwards, and which content receiver fits its body.

use http::header::{ACCESS_CONTROL_REQUEST_METHOD, CONNECTION, CONTENT_TYPE, EXPECT};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Returns true for the methods that may carry a request body into a content receiver.
    pub fn accepts_body(&self) -> bool {
        matches!(self.method(), &Method::POST | &Method::PUT)
    }

    /// Returns true for the methods the connection dispatches once the (empty) body is complete.
    pub fn is_bodyless_method(&self) -> bool {
        matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS)
    }

    /// `Expect: 100-continue`, compared case-insensitively.
    pub fn is_100_continue_expected(&self) -> bool {
        self.headers()
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }

    /// An `OPTIONS` request announcing the method of the actual request.
    pub fn is_preflight(&self) -> bool {
        self.method() == Method::OPTIONS && self.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// Whether the client allows the connection to be reused after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent, HTTP/1.0 only keeps
    /// the connection when `Connection: keep-alive` is present.
    pub fn wants_keep_alive(&self) -> bool {
        let has_token = |token: &[u8]| {
            self.headers().get_all(CONNECTION).iter().any(|value| {
                value.as_bytes().split(|b| *b == b',').any(|part| part.trim_ascii().eq_ignore_ascii_case(token))
            })
        };

        match self.version() {
            Version::HTTP_11 => !has_token(b"close"),
            _ => has_token(b"keep-alive"),
        }
    }

    /// The raw `Content-Type` value, if present and visible ASCII.
    pub fn content_type(&self) -> Option<&str> {
        self.headers().get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(builder: http::request::Builder) -> RequestHeader {
        RequestHeader::from(builder.body(()).unwrap())
    }

    #[test]
    fn continue_expectation() {
        let req = header(Request::post("/upload").header(EXPECT, "100-Continue"));
        assert!(req.is_100_continue_expected());

        let req = header(Request::post("/upload").header(EXPECT, "something-else"));
        assert!(!req.is_100_continue_expected());

        let req = header(Request::post("/upload"));
        assert!(!req.is_100_continue_expected());
    }

    #[test]
    fn preflight_needs_options_and_request_method() {
        let req = header(Request::options("/api").header(ACCESS_CONTROL_REQUEST_METHOD, "PUT"));
        assert!(req.is_preflight());

        let req = header(Request::options("/api"));
        assert!(!req.is_preflight());

        let req = header(Request::get("/api").header(ACCESS_CONTROL_REQUEST_METHOD, "PUT"));
        assert!(!req.is_preflight());
    }

    #[test]
    fn keep_alive_by_version() {
        let req = header(Request::get("/").version(Version::HTTP_11));
        assert!(req.wants_keep_alive());

        let req = header(Request::get("/").version(Version::HTTP_11).header(CONNECTION, "Close"));
        assert!(!req.wants_keep_alive());

        let req = header(Request::get("/").version(Version::HTTP_10));
        assert!(!req.wants_keep_alive());

        let req = header(Request::get("/").version(Version::HTTP_10).header(CONNECTION, "upgrade, Keep-Alive"));
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn method_classes() {
        assert!(header(Request::put("/")).accepts_body());
        assert!(!header(Request::delete("/")).accepts_body());
        assert!(header(Request::delete("/")).is_bodyless_method());
        assert!(!header(Request::patch("/")).is_bodyless_method());
        assert!(!header(Request::patch("/")).accepts_body());
    }
}
