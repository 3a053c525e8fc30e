//! Request head decoder.
//!
//! Parses the request line and header fields with `httparse`, then rebuilds them as an
//! `http::Request<()>` whose URI and header values are slices of the frozen head bytes.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum head size: 8KB
//! - HTTP/1.0 and HTTP/1.1 only

use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, Request, Uri, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire head
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Byte offsets of one header field inside the head buffer: `(name_start, name_end, value_start, value_end)`.
type FieldOffsets = (usize, usize, usize, usize);

/// Decodes a request head and determines how its payload is framed.
#[derive(Debug, Default)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let status = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let head_len = match status {
            Status::Complete(head_len) => head_len,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };
        trace!(head_len, "parsed request head");
        ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            other => return Err(ParseError::InvalidVersion(other)),
        };
        let method = req.method.ok_or(ParseError::InvalidMethod)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_e| ParseError::InvalidMethod)?;

        let base = src.as_ptr() as usize;
        let path = req.path.ok_or(ParseError::InvalidUri)?;
        let path_offsets = offsets_of(base, path.as_bytes());

        let field_count = req.headers.len();
        let mut fields = [(0, 0, 0, 0); MAX_HEADER_NUM];
        for (header, slot) in req.headers.iter().zip(fields.iter_mut()) {
            let (name_start, name_end) = offsets_of(base, header.name.as_bytes());
            let (value_start, value_end) = offsets_of(base, header.value);
            *slot = (name_start, name_end, value_start, value_end);
        }

        let head = src.split_to(head_len).freeze();
        let header = build_header(&head, method, version, path_offsets, &fields[..field_count])?;
        let payload_size = parse_payload(&header)?;

        Ok(Some((header, payload_size)))
    }
}

fn offsets_of(base: usize, part: &[u8]) -> (usize, usize) {
    let start = part.as_ptr() as usize - base;
    (start, start + part.len())
}

fn build_header(
    head: &Bytes,
    method: Method,
    version: Version,
    path: (usize, usize),
    fields: &[FieldOffsets],
) -> Result<RequestHeader, ParseError> {
    let uri = Uri::from_maybe_shared(head.slice(path.0..path.1)).map_err(|_e| ParseError::InvalidUri)?;

    let mut request = Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;

    let headers = request.headers_mut();
    headers.reserve(fields.len());
    for &(name_start, name_end, value_start, value_end) in fields {
        let name = HeaderName::from_bytes(&head[name_start..name_end]).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_maybe_shared(head.slice(value_start..value_end)).map_err(ParseError::invalid_header)?;
        headers.append(name, value);
    }

    Ok(RequestHeader::from(request))
}

/// Determines payload framing from `Transfer-Encoding` and `Content-Length`.
///
/// Framing applies to every method; deciding whether a method may carry a body is left to the
/// connection, which rejects bodies on methods that must not have one.
///
/// refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = header.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::new_empty()),

        (Some(te_value), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::new_chunked())
            } else {
                Ok(PayloadSize::new_empty())
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_e| ParseError::invalid_content_length("value can't to_str"))?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_e| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
            Ok(PayloadSize::new_length(length))
        }

        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers"))
        }
    }
}

/// `chunked` must be the last transfer coding to frame the body.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
