//! Decoder for bodies framed by `Content-Length`.

use std::cmp;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem};

/// Yields chunks until exactly the declared number of bytes has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    remaining: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Some(PayloadItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let take = cmp::min(self.remaining, src.len() as u64) as usize;
        let bytes = src.split_to(take).freeze();
        self.remaining -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_declared_length() {
        let mut buf = BytesMut::from(&b"0123456789GET /next"[..]);
        let mut decoder = LengthDecoder::new(10);

        let chunk = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap().as_ref(), b"0123456789");

        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(PayloadItem::Eof));
        assert_eq!(&buf[..], b"GET /next");
    }

    #[test]
    fn partial_data_streams_out() {
        let mut buf = BytesMut::from(&b"abc"[..]);
        let mut decoder = LengthDecoder::new(5);

        let chunk = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap().as_ref(), b"abc");
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"de");
        let chunk = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap().as_ref(), b"de");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(PayloadItem::Eof));
    }
}
