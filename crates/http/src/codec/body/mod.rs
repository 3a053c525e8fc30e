//! Body codecs.
//!
//! Request bodies are decoded by [`PayloadDecoder`] (content-length, chunked or none) and
//! response bodies encoded by [`PayloadEncoder`], both selected from a [`PayloadSize`].
//!
//! [`PayloadSize`]: crate::protocol::PayloadSize

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
