//! Decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! Works line by line: a hex size line (extensions are skipped), the chunk data, its CRLF,
//! and after the zero-size chunk any trailer fields up to the terminating empty line.
//!
//! refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding

use crate::protocol::{ParseError, PayloadItem};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Longest size line or trailer field accepted before giving up on finding its CRLF
const MAX_LINE_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for `<hex size>[;extensions]\r\n`
    SizeLine,
    /// Inside chunk data, with the number of bytes still owed
    Data(u64),
    /// Waiting for the CRLF closing a chunk's data
    DataCrlf,
    /// After the zero-size chunk: trailer fields until an empty line
    Trailers,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::SizeLine }
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::SizeLine => {
                    let Some(line_len) = find_line(src)? else {
                        return Ok(None);
                    };
                    let size = parse_size(&src[..line_len])?;
                    src.advance(line_len + 2);
                    self.state = if size == 0 { State::Trailers } else { State::Data(size) };
                }

                State::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64);
                    let bytes = src.split_to(take as usize).freeze();
                    let left = remaining - take;
                    self.state = if left == 0 { State::DataCrlf } else { State::Data(left) };
                    trace!(len = bytes.len(), left, "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataCrlf => {
                    match src.len() {
                        0 => return Ok(None),
                        1 if src[0] == b'\r' => return Ok(None),
                        _ if src.starts_with(b"\r\n") => {
                            src.advance(2);
                            self.state = State::SizeLine;
                        }
                        _ => return Err(ParseError::invalid_body("chunk data is not followed by CRLF")),
                    }
                }

                State::Trailers => {
                    let Some(line_len) = find_line(src)? else {
                        return Ok(None);
                    };
                    src.advance(line_len + 2);
                    if line_len == 0 {
                        trace!("finished reading chunked data");
                        self.state = State::Done;
                    }
                }

                State::Done => return Ok(Some(PayloadItem::Eof)),
            }
        }
    }
}

/// Length of the next CRLF-terminated line, or `None` while the CRLF has not arrived.
fn find_line(src: &BytesMut) -> Result<Option<usize>, ParseError> {
    match src.windows(2).position(|window| window == b"\r\n") {
        Some(position) => {
            if src[..position].contains(&b'\n') {
                return Err(ParseError::invalid_body("bare LF inside chunked framing"));
            }
            Ok(Some(position))
        }
        None if src.len() > MAX_LINE_BYTES => Err(ParseError::invalid_body("chunked framing line too long")),
        None => Ok(None),
    }
}

fn parse_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|b| *b == b';') {
        Some(extension_start) => &line[..extension_start],
        None => line,
    };
    let digits = digits.trim_ascii();

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::invalid_body("invalid chunk size"));
    }

    digits.iter().try_fold(0u64, |size, b| {
        let digit = (*b as char).to_digit(16).map(u64::from).unwrap_or_default();
        size.checked_mul(16)
            .and_then(|size| size.checked_add(digit))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflows"))
    })
}
