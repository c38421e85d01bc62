//! Unified encoder over the response body framings.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::codec::body::raw_encoder::RawEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};

/// Encodes a response body according to the framing the engine picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthEncoder),
    Chunked(ChunkedEncoder),
    Raw(RawEncoder),
    NoBody,
}

impl PayloadEncoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    pub fn fixed(length: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(length)) }
    }

    pub fn close_delimited() -> Self {
        Self { kind: Kind::Raw(RawEncoder::new()) }
    }

    /// Whether all body bytes for this response have been encoded.
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::Raw(encoder) => encoder.is_finish(),
            Kind::NoBody => true,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fixed(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::CloseDelimited => Self::close_delimited(),
            PayloadSize::Empty => Self::empty(),
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::Raw(encoder) => encoder.encode(item, dst),
            Kind::NoBody => Ok(()),
        }
    }
}
