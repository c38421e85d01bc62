use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

/// Writes body bytes raw with no framing at all.
///
/// Used for close-delimited responses: the engine closes the socket after the
/// EOF marker, and that close is what ends the body for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEncoder {
    eof: bool,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self { eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl Default for RawEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for RawEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                if !self.eof {
                    dst.extend_from_slice(bytes.chunk());
                }
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                Ok(())
            }
        }
    }
}
