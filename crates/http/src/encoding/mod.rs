//! Gzip compression for response bodies.
//!
//! Three shapes, matching the engine's framing branches: whole-buffer
//! compression for small known-length bodies, an incremental [`GzipStream`]
//! for bodies streamed through chunked or close-delimited framing, and the
//! trial compression behind the auto-detect policy.

use std::io::{self, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;

/// Compresses a complete buffer in one go.
pub fn gzip_bytes(data: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Writer::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.buf.freeze())
}

/// An incremental gzip encoder for streamed bodies.
///
/// Feed chunks with [`write`](GzipStream::write) and send whatever comes
/// back; [`finish`](GzipStream::finish) flushes the trailer.
pub struct GzipStream {
    encoder: Option<GzEncoder<Writer>>,
}

impl std::fmt::Debug for GzipStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipStream").field("finished", &self.encoder.is_none()).finish()
    }
}

impl GzipStream {
    pub fn new() -> Self {
        Self { encoder: Some(GzEncoder::new(Writer::new(), Compression::default())) }
    }

    /// Compresses a chunk, returning the output bytes ready so far.
    pub fn write(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "gzip stream already finished"))?;
        encoder.write_all(data)?;
        Ok(encoder.get_mut().take())
    }

    /// Ends the stream and returns the remaining compressed bytes.
    pub fn finish(&mut self) -> io::Result<Bytes> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "gzip stream already finished"))?;
        Ok(encoder.finish()?.buf.freeze())
    }
}

impl Default for GzipStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether compressing `sample` shrinks it by at least one percent.
///
/// The auto-detect policy calls this on a slice from the middle of a
/// seekable body before committing to compressing the whole response.
pub fn sample_compresses_well(sample: &[u8]) -> bool {
    match gzip_bytes(sample) {
        Ok(compressed) => (compressed.len() as u64) * 100 <= (sample.len() as u64) * 99,
        Err(_) => false,
    }
}

/// Growable output sink shared by the encoders.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8 * 1024) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn whole_buffer_round_trip() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let compressed = gzip_bytes(&input).unwrap();
        assert!(compressed.len() < input.len());
        assert_eq!(gunzip(&compressed), input);
    }

    #[test]
    fn streamed_output_matches_input() {
        let mut stream = GzipStream::new();
        let mut wire = Vec::new();
        for chunk in [&b"abcabcabc"[..], &b"defdefdef"[..], &b"ghighighi"[..]] {
            wire.extend_from_slice(&stream.write(chunk).unwrap());
        }
        wire.extend_from_slice(&stream.finish().unwrap());
        assert_eq!(gunzip(&wire), b"abcabcabcdefdefdefghighighi");
    }

    #[test]
    fn repetitive_sample_detects_as_compressible() {
        let sample = b"aaaaaaaaaa".repeat(100);
        assert!(sample_compresses_well(&sample));
    }

    #[test]
    fn incompressible_sample_detects_as_not() {
        // pseudo-random bytes barely compress
        let mut state = 0x12345678u32;
        let sample: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        assert!(!sample_compresses_well(&sample));
    }
}
