mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;
mod raw_encoder;

pub use chunked_decoder::ChunkedDecoder;
pub use chunked_encoder::ChunkedEncoder;
pub use length_decoder::LengthDecoder;
pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
pub use raw_encoder::RawEncoder;

use bytes::{BufMut, BytesMut};
use std::io;

/// `io::Write` adapter over `BytesMut`, for `write!` of framing prefixes.
pub(crate) struct BufWriter<'a>(pub &'a mut BytesMut);

impl io::Write for BufWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadItem;
    use bytes::Bytes;
    use tokio_util::codec::{Decoder, Encoder};

    /// Chunked encode followed by chunked decode is the identity on any byte
    /// sequence split any way.
    #[test]
    fn chunked_round_trip_is_identity() {
        let inputs: Vec<Vec<Bytes>> = vec![
            vec![],
            vec![Bytes::from_static(b"")],
            vec![Bytes::from_static(b"hello")],
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc"), Bytes::from_static(b"d")],
            vec![Bytes::from(vec![0u8; 70_000])],
        ];

        for chunks in inputs {
            let expected: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();

            let mut encoder = ChunkedEncoder::new();
            let mut wire = BytesMut::new();
            for chunk in chunks {
                encoder.encode(PayloadItem::Chunk(chunk), &mut wire).unwrap();
            }
            encoder.encode(PayloadItem::<Bytes>::Eof, &mut wire).unwrap();

            let mut decoder = ChunkedDecoder::new();
            let mut decoded = Vec::new();
            loop {
                match decoder.decode(&mut wire).unwrap() {
                    Some(PayloadItem::Chunk(bytes)) => decoded.extend_from_slice(&bytes),
                    Some(PayloadItem::Eof) => break,
                    None => panic!("decoder stalled on complete input"),
                }
            }
            assert_eq!(decoded, expected);
        }
    }
}
