//! Head codecs: [`HeaderDecoder`] for request heads, [`HeaderEncoder`] for response heads.

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;
pub(crate) use header_encoder::BytesWriter;
