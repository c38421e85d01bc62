//! Decoder for chunked transfer encoding.
//!
//! Chunk extensions are skipped, trailer fields are read and discarded, and
//! the final empty chunk yields [`PayloadItem::Eof`].

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

/// Largest chunk size accepted, to keep the hex accumulator from overflowing
const MAX_CHUNK_SIZE: u64 = u64::MAX / 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the hex chunk size
    Size,
    /// Skipping whitespace or a chunk extension after the size
    Extension,
    /// Expecting the LF that ends the size line
    SizeLf,
    /// Reading chunk data
    Data,
    /// Expecting CR after chunk data
    DataCr,
    /// Expecting LF after chunk data
    DataLf,
    /// Reading a trailer line; true once the line has any content
    Trailer(bool),
    /// All chunks and trailers consumed
    Done,
}

/// A decoder for chunked transfer encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, remaining: 0 }
    }

    fn bad(reason: &str) -> ParseError {
        ParseError::invalid_body(format!("chunked encoding: {reason}"))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == State::Done {
                trace!("chunked body complete");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                return Ok(None);
            }

            match self.state {
                State::Size => {
                    let digit = match src[0] {
                        b @ b'0'..=b'9' => u64::from(b - b'0'),
                        b @ b'a'..=b'f' => u64::from(b - b'a' + 10),
                        b @ b'A'..=b'F' => u64::from(b - b'A' + 10),
                        b'\r' => {
                            src.advance(1);
                            self.state = State::SizeLf;
                            continue;
                        }
                        b' ' | b'\t' | b';' => {
                            src.advance(1);
                            self.state = State::Extension;
                            continue;
                        }
                        _ => return Err(Self::bad("invalid size digit")),
                    };
                    if self.remaining > MAX_CHUNK_SIZE {
                        return Err(Self::bad("chunk size overflow"));
                    }
                    self.remaining = self.remaining * 16 + digit;
                    src.advance(1);
                }

                State::Extension => match src[0] {
                    b'\r' => {
                        src.advance(1);
                        self.state = State::SizeLf;
                    }
                    b'\n' => return Err(Self::bad("bare LF in extension")),
                    _ => src.advance(1),
                },

                State::SizeLf => {
                    if src[0] != b'\n' {
                        return Err(Self::bad("missing LF after size"));
                    }
                    src.advance(1);
                    self.state = if self.remaining == 0 { State::Trailer(false) } else { State::Data };
                }

                State::Data => {
                    let take = self.remaining.min(src.len() as u64) as usize;
                    let bytes = src.split_to(take).freeze();
                    self.remaining -= bytes.len() as u64;
                    if self.remaining == 0 {
                        self.state = State::DataCr;
                    }
                    trace!(len = bytes.len(), "chunk data");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataCr => {
                    if src[0] != b'\r' {
                        return Err(Self::bad("missing CR after data"));
                    }
                    src.advance(1);
                    self.state = State::DataLf;
                }

                State::DataLf => {
                    if src[0] != b'\n' {
                        return Err(Self::bad("missing LF after data"));
                    }
                    src.advance(1);
                    self.state = State::Size;
                }

                State::Trailer(has_content) => match src[0] {
                    b'\n' => {
                        src.advance(1);
                        self.state = if has_content { State::Trailer(false) } else { State::Done };
                    }
                    b'\r' => src.advance(1),
                    _ => {
                        src.advance(1);
                        self.state = State::Trailer(true);
                    }
                },

                State::Done => unreachable!("handled at loop top"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn collect(decoder: &mut ChunkedDecoder, buf: &mut BytesMut) -> (Vec<Bytes>, bool) {
        let mut chunks = Vec::new();
        loop {
            match decoder.decode(buf).unwrap() {
                Some(PayloadItem::Chunk(bytes)) => chunks.push(bytes),
                Some(PayloadItem::Eof) => return (chunks, true),
                None => return (chunks, false),
            }
        }
    }

    #[test]
    fn two_chunks_and_eof() {
        let mut buf = BytesMut::from(&b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nleftover"[..]);
        let mut decoder = ChunkedDecoder::new();
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(chunks, vec![Bytes::from_static(b"Wiki"), Bytes::from_static(b"pedia")]);
        assert_eq!(&buf[..], b"leftover");
    }

    #[test]
    fn uppercase_hex_and_extension() {
        let mut buf = BytesMut::from(&b"A;name=val\r\n0123456789\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(chunks, vec![Bytes::from_static(b"0123456789")]);
    }

    #[test]
    fn split_across_reads() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"6\r\nab"[..]);
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(!done);
        assert_eq!(chunks, vec![Bytes::from_static(b"ab")]);

        buf.extend_from_slice(b"cdef\r\n0\r\n");
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(!done);
        assert_eq!(chunks, vec![Bytes::from_static(b"cdef")]);

        buf.extend_from_slice(b"\r\n");
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert!(chunks.is_empty());
    }

    #[test]
    fn trailers_are_discarded() {
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n0\r\nX-Checksum: 99\r\n\r\nrest"[..]);
        let mut decoder = ChunkedDecoder::new();
        let (chunks, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(chunks, vec![Bytes::from_static(b"abc")]);
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn garbage_size_errors() {
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }
}
