//! Streaming response encoder.
//!
//! Mirrors the request decoder's two-phase shape: a head installs the payload
//! encoder matching the framing the engine chose, then payload items flow
//! until EOF. [`ResponseEncoder::abort_body`] discards a pending payload
//! encoder; the engine uses it for HEAD responses, whose heads advertise a
//! body that is never sent.

use bytes::{Buf, BytesMut};
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

/// Encoder producing response heads and framed payload bytes.
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Drops the pending payload encoder installed by the last head.
    pub fn abort_body(&mut self) {
        self.payload_encoder.take();
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Head((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("response head encoded while previous payload is unfinished");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                if !payload_size.is_empty() {
                    self.payload_encoder = Some(payload_size.into());
                }
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    // a trailing EOF for an already-complete fixed-length body
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("payload item encoded with no response head in flight");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}
