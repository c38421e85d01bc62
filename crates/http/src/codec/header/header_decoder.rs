//! Request header decoding.
//!
//! The decoder accumulates bytes until the first `CRLFCRLF`, unfolds obsolete
//! continuation lines, and parses the block with `httparse`. Anything already
//! read past the terminator stays in the buffer and is picked up by the body
//! phase, so excess bytes carry forward naturally.
//!
//! Error mapping is part of the contract here: a header block over the
//! configured limit produces [`ParseError::TooLargeHeader`] (the engine
//! closes without answering), an unknown method maps to 501, an unparseable
//! version to 505, and everything else malformed to 400.

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Method, Request, Uri, Version, header};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead};

/// Maximum number of header fields in a request
const MAX_HEADER_NUM: usize = 256;

/// Decoder for an HTTP request head.
pub struct HeaderDecoder {
    max_header_bytes: usize,
}

impl HeaderDecoder {
    pub fn new(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(head_end) = find_block_end(src) else {
            // still accumulating; a block that cannot fit the limit is cut off now
            ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
            return Ok(None);
        };

        ensure!(head_end <= self.max_header_bytes, ParseError::too_large_header(head_end, self.max_header_bytes));
        trace!(head_bytes = head_end, "request head complete");

        let block = src.split_to(head_end);
        let unfolded = unfold(&block);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Request::new(&mut headers);
        let status = parsed.parse(&unfolded).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            httparse::Error::Version => ParseError::UnsupportedVersion,
            e => ParseError::invalid_header(e.to_string()),
        })?;
        ensure!(matches!(status, Status::Complete(_)), ParseError::invalid_header("truncated header block"));

        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(ParseError::UnsupportedVersion),
        };

        let method = match parsed.method {
            Some("GET") => Method::GET,
            Some("HEAD") => Method::HEAD,
            Some("POST") => Method::POST,
            Some(other) => return Err(ParseError::unsupported_method(other)),
            None => return Err(ParseError::invalid_header("missing method")),
        };

        let uri =
            parsed.path.ok_or(ParseError::InvalidUri)?.parse::<Uri>().map_err(|_| ParseError::InvalidUri)?;

        let mut builder = Request::builder().method(method).uri(uri).version(version);
        let header_map = builder.headers_mut().ok_or(ParseError::InvalidUri)?;
        header_map.reserve(parsed.headers.len());
        for field in parsed.headers.iter() {
            let name = HeaderName::from_bytes(field.name.as_bytes())
                .map_err(|_| ParseError::invalid_header(format!("bad header name: {}", field.name)))?;
            let value = HeaderValue::from_bytes(field.value)
                .map_err(|_| ParseError::invalid_header(format!("bad value for header {}", field.name)))?;
            header_map.append(name, value);
        }

        let head = RequestHead::from(builder.body(()).map_err(|_| ParseError::InvalidUri)?);

        if head.version() == Version::HTTP_11
            && head.uri().host().is_none()
            && !head.headers().contains_key(header::HOST)
        {
            return Err(ParseError::invalid_header("HTTP/1.1 request without Host"));
        }

        let payload_size = parse_payload(&head)?;
        Ok(Some((head, payload_size)))
    }
}

/// Index one past the `CRLFCRLF` terminating the header block.
fn find_block_end(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Rewrites obsolete line folding into single-space joins.
///
/// A continuation line (CRLF followed by SP or TAB) appends to the previous
/// field value with exactly one separating space, which is also what lets
/// `httparse` accept the block.
fn unfold(block: &[u8]) -> Vec<u8> {
    if !block.windows(3).any(|w| w[0] == b'\r' && w[1] == b'\n' && (w[2] == b' ' || w[2] == b'\t')) {
        return block.to_vec();
    }

    let mut out = Vec::with_capacity(block.len());
    let mut i = 0;
    while i < block.len() {
        if block[i] == b'\r'
            && block.get(i + 1) == Some(&b'\n')
            && matches!(block.get(i + 2), Some(b' ') | Some(b'\t'))
        {
            out.push(b' ');
            i += 2;
            while matches!(block.get(i), Some(b' ') | Some(b'\t')) {
                i += 1;
            }
        } else {
            out.push(block[i]);
            i += 1;
        }
    }
    out
}

/// Determines request body framing from Content-Length and Transfer-Encoding.
fn parse_payload(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    let te_header = head.headers().get(header::TRANSFER_ENCODING);
    let cl_header = head.headers().get(header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::Empty),

        (Some(te_value), None) => {
            // chunked must be the final encoding to be decodable
            let is_chunked = te_value
                .as_bytes()
                .rsplit(|b| *b == b',')
                .next()
                .is_some_and(|token| token.trim_ascii().eq_ignore_ascii_case(b"chunked"));
            if is_chunked {
                Ok(PayloadSize::Chunked)
            } else {
                // a body is coming but its size cannot be determined
                Err(ParseError::LengthRequired)
            }
        }

        (None, Some(cl_value)) => {
            let cl_str =
                cl_value.to_str().map_err(|_| ParseError::invalid_content_length("not visible ascii"))?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not a u64")))?;
            if length == 0 { Ok(PayloadSize::Empty) } else { Ok(PayloadSize::Length(length)) }
        }

        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("both transfer-encoding and content-length present"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn decoder() -> HeaderDecoder {
        HeaderDecoder::new(256 * 1024)
    }

    fn crlf(text: &str) -> BytesMut {
        BytesMut::from(text.replace('\n', "\r\n").as_str())
    }

    #[test]
    fn basic_get() {
        let mut buf = crlf(indoc! {"
            GET /index.html?q=1 HTTP/1.1
            Host: 127.0.0.1:8080
            User-Agent: curl/7.79.1
            Accept: */*

            "});

        let (head, payload) = decoder().decode(&mut buf).unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(head.method(), &Method::GET);
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.uri().path(), "/index.html");
        assert_eq!(head.uri().query(), Some("q=1"));
        assert_eq!(head.headers().len(), 3);
        assert_eq!(head.headers().get(header::HOST).unwrap(), "127.0.0.1:8080");
        assert!(buf.is_empty());
    }

    #[test]
    fn body_bytes_stay_in_buffer() {
        let mut buf = crlf(indoc! {"
            POST /submit HTTP/1.1
            Host: x
            Content-Length: 3

            abc"});

        let (_, payload) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload, PayloadSize::Length(3));
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn incomplete_head_needs_more() {
        let mut buf = BytesMut::from("GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(decoder().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 25);
    }

    #[test]
    fn continuation_lines_join_with_single_space() {
        let mut buf = BytesMut::from(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Long: first\r\n  \t second\r\nAccept: */*\r\n\r\n",
        );
        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.headers().get("x-long").unwrap(), "first second");
        assert_eq!(head.headers().get(header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let mut buf = crlf("BREW /pot HTTP/1.1\nHost: x\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn unknown_version_is_unsupported() {
        let mut buf = crlf("GET / HTTP/3.0\nHost: x\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::HTTP_VERSION_NOT_SUPPORTED));
    }

    #[test]
    fn missing_host_on_http11_is_bad_request() {
        let mut buf = crlf("GET / HTTP/1.1\nAccept: */*\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn http10_without_host_is_fine() {
        let mut buf = crlf("GET / HTTP/1.0\n\n");
        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.version(), Version::HTTP_10);
    }

    #[test]
    fn absolute_target_parses() {
        let mut buf = crlf("GET http://api.example.com:81/v1/users HTTP/1.1\nHost: ignored\n\n");
        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.uri().host(), Some("api.example.com"));
        assert_eq!(head.target_host(), Some(("api.example.com".to_owned(), Some(81))));
    }

    #[test]
    fn header_block_at_limit_is_accepted() {
        let mut request = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ".to_vec();
        let limit = 512;
        let padding = limit - request.len() - 4;
        request.extend(std::iter::repeat_n(b'a', padding));
        request.extend_from_slice(b"\r\n\r\n");
        assert_eq!(request.len(), limit);

        let mut buf = BytesMut::from(&request[..]);
        assert!(HeaderDecoder::new(limit).decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn header_block_over_limit_is_rejected() {
        let mut request = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ".to_vec();
        let limit = 512;
        let padding = limit - request.len() - 3;
        request.extend(std::iter::repeat_n(b'a', padding));
        request.extend_from_slice(b"\r\n\r\n");
        assert_eq!(request.len(), limit + 1);

        let mut buf = BytesMut::from(&request[..]);
        let err = HeaderDecoder::new(limit).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::TooLargeHeader { .. }));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn chunked_transfer_encoding_detected() {
        let mut buf = crlf("POST /up HTTP/1.1\nHost: x\nTransfer-Encoding: chunked\n\n");
        let (_, payload) = decoder().decode(&mut buf).unwrap().unwrap();
        assert!(payload.is_chunked());
    }

    #[test]
    fn non_chunked_transfer_encoding_requires_length() {
        let mut buf = crlf("POST /up HTTP/1.1\nHost: x\nTransfer-Encoding: gzip\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::LENGTH_REQUIRED));
    }
}
