use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

/// Writes at most the declared `Content-Length`; extra bytes from a misbehaving body are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    length: u64,
    eof: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { length, eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut bytes) => {
                while bytes.has_remaining() && self.length > 0 {
                    let chunk = bytes.chunk();
                    let len = chunk.len().min(self.length as usize);
                    dst.extend_from_slice(&chunk[..len]);
                    bytes.advance(len);
                    self.length -= len as u64;
                }
                if bytes.has_remaining() {
                    warn!(dropped = bytes.remaining(), "response body exceeds its content-length");
                }
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                if self.length > 0 {
                    return Err(SendError::invalid_body(format!("response body is {} bytes short", self.length)));
                }
                Ok(())
            }
        }
    }
}
