//! Encoder for chunked transfer encoding.
//!
//! Each chunk is written as its size in hex, CRLF, the data, CRLF; the EOF
//! marker becomes the terminating zero-length chunk. No trailers are
//! produced.

use std::io::Write;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::body::BufWriter;
use crate::protocol::{PayloadItem, SendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false }
    }

    /// Whether the terminating zero chunk has been written.
    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(bytes) => {
                if bytes.remaining() == 0 {
                    // a zero-length chunk would terminate the body early
                    return Ok(());
                }
                write!(BufWriter(dst), "{:X}\r\n", bytes.remaining())?;
                dst.reserve(bytes.remaining() + 2);
                dst.extend_from_slice(bytes.chunk());
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frames_chunks_and_terminator() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        for piece in ["a", "bc", "d"] {
            encoder.encode(PayloadItem::Chunk(Bytes::from_static(piece.as_bytes())), &mut dst).unwrap();
        }
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert_eq!(&dst[..], b"1\r\na\r\n2\r\nbc\r\n1\r\nd\r\n0\r\n\r\n");
        assert!(encoder.is_finish());
    }

    #[test]
    fn hex_sizes() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();
        let payload = Bytes::from(vec![b'x'; 26]);
        encoder.encode(PayloadItem::Chunk(payload), &mut dst).unwrap();
        assert!(dst.starts_with(b"1A\r\n"));
    }

    #[test]
    fn empty_chunks_are_suppressed() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::new()), &mut dst).unwrap();
        assert!(dst.is_empty());
        assert!(!encoder.is_finish());
    }

    #[test]
    fn nothing_after_eof() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"late")), &mut dst).unwrap();
        assert_eq!(&dst[..], b"0\r\n\r\n");
    }
}
