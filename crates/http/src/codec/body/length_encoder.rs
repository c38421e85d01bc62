use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::protocol::{PayloadItem, SendError};

/// Writes body bytes raw, counting down a declared content length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub fn is_finish(&self) -> bool {
        self.remaining == 0
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                if bytes.remaining() == 0 {
                    return Ok(());
                }
                let len = bytes.remaining() as u64;
                if len > self.remaining {
                    warn!(extra = len - self.remaining, "body produced more bytes than its declared length");
                    return Err(SendError::invalid_body("body exceeds declared content-length"));
                }
                dst.extend_from_slice(bytes.chunk());
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof => {
                if self.remaining > 0 {
                    warn!(missing = self.remaining, "body ended short of its declared length");
                    self.remaining = 0;
                }
                Ok(())
            }
        }
    }
}
