//! Wire codecs for HTTP/1.x.
//!
//! [`RequestDecoder`] turns inbound bytes into a head followed by body items and an EOF;
//! [`ResponseEncoder`] does the reverse for responses. Both plug into
//! `tokio_util::codec::{FramedRead, FramedWrite}`.

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
