//! Response header serialization.
//!
//! Writes the status line and header fields, and owns the framing header:
//! the caller states how the payload will be framed via [`PayloadSize`] and
//! the encoder makes `Content-Length` / `Transfer-Encoding` agree with it.

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, header};
use std::io::{self, Write};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadSize, ResponseHead, SendError, status_forbids_body};

/// Initial buffer size reserved for header serialization
const INIT_HEAD_SIZE: usize = 4 * 1024;

/// Encoder for an HTTP response head.
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;
        let status = head.status();

        dst.reserve(INIT_HEAD_SIZE);
        write!(
            FastWrite(dst),
            "HTTP/1.1 {} {}\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or("Unknown")
        )?;

        let headers = head.headers_mut();
        match payload_size {
            PayloadSize::Length(n) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
                headers.remove(header::TRANSFER_ENCODING);
            }
            PayloadSize::Chunked => {
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                headers.remove(header::CONTENT_LENGTH);
            }
            PayloadSize::CloseDelimited => {
                // the closing socket is the framing
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::TRANSFER_ENCODING);
            }
            PayloadSize::Empty => {
                headers.remove(header::TRANSFER_ENCODING);
                if status_forbids_body(status) {
                    headers.remove(header::CONTENT_LENGTH);
                } else {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
            }
        }

        for (name, value) in head.headers().iter() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writer over `BytesMut` for the status line; space is already reserved.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
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
    use http::{Response, StatusCode};

    fn encode(head: ResponseHead, size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn status_line_and_length() {
        let head = Response::builder().status(StatusCode::OK).header("content-type", "text/plain").body(()).unwrap();
        let wire = encode(head, PayloadSize::Length(2));
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-type: text/plain\r\n"));
        assert!(wire.contains("content-length: 2\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunked_replaces_stale_content_length() {
        let head = Response::builder().header("content-length", "999").body(()).unwrap();
        let wire = encode(head, PayloadSize::Chunked);
        assert!(wire.contains("transfer-encoding: chunked\r\n"));
        assert!(!wire.contains("content-length"));
    }

    #[test]
    fn close_delimited_has_no_framing_headers() {
        let head = Response::builder().body(()).unwrap();
        let wire = encode(head, PayloadSize::CloseDelimited);
        assert!(!wire.contains("content-length"));
        assert!(!wire.contains("transfer-encoding"));
    }

    #[test]
    fn empty_body_gets_zero_length_except_when_forbidden() {
        let ok = Response::builder().status(StatusCode::OK).body(()).unwrap();
        assert!(encode(ok, PayloadSize::Empty).contains("content-length: 0\r\n"));

        let not_modified = Response::builder().status(StatusCode::NOT_MODIFIED).body(()).unwrap();
        let wire = encode(not_modified, PayloadSize::Empty);
        assert!(wire.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!wire.contains("content-length"));
    }
}
