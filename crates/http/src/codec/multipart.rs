//! Incremental `multipart/form-data` parsing.
//!
//! The parser is push-based: the engine feeds it payload chunks as they come
//! off the socket and drains events between feeds, so file parts can stream
//! to disk without the whole body ever being in memory. Part boundaries are
//! `CRLF "--" boundary`; the final delimiter carries a trailing `"--"`.

use bytes::{Buf, Bytes, BytesMut};

use crate::ensure;
use crate::protocol::ParseError;

/// Longest boundary accepted; anything longer marks the body malformed
pub const MAX_BOUNDARY_LEN: usize = 1024;

/// Cap on one part's header block
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

/// Headers of one multipart part, as far as form parsing cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    /// The `name` parameter of Content-Disposition
    pub name: Option<String>,
    /// The `filename` parameter, present for file uploads
    pub filename: Option<String>,
    /// The part's own Content-Type
    pub content_type: Option<String>,
}

/// One parsing step's output.
#[derive(Debug, PartialEq, Eq)]
pub enum MultipartEvent {
    /// A new part begins with these headers
    PartStart(PartHeaders),
    /// Body bytes of the current part
    Data(Bytes),
    /// The current part is complete
    PartEnd,
    /// The closing delimiter was seen; no more parts follow
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the first delimiter; preamble text is discarded
    Preamble,
    /// Right after a delimiter: `--` closes the body, CRLF opens headers
    AfterDelimiter,
    /// Accumulating one part's header block
    Headers,
    /// Streaming part data until the next delimiter
    Data,
    /// Closing delimiter seen
    Finished,
}

/// Incremental parser for one `multipart/form-data` body.
#[derive(Debug)]
pub struct MultipartParser {
    /// `CRLF "--" boundary`, the delimiter between parts
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
    /// Set once the wire ended; flushes trailing data
    input_done: bool,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Result<Self, ParseError> {
        ensure!(!boundary.is_empty(), ParseError::invalid_body("empty multipart boundary"));
        ensure!(
            boundary.len() <= MAX_BOUNDARY_LEN,
            ParseError::invalid_body(format!("multipart boundary longer than {MAX_BOUNDARY_LEN} bytes"))
        );
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Ok(Self { delimiter, buf: BytesMut::new(), state: State::Preamble, input_done: false })
    }

    /// Appends wire bytes for parsing.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Marks the end of input; remaining buffered bytes must complete the body.
    pub fn input_done(&mut self) {
        self.input_done = true;
    }

    /// Whether the closing delimiter has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Produces the next event, or `None` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<MultipartEvent>, ParseError> {
        loop {
            match self.state {
                State::Preamble => {
                    // the first delimiter may appear without the leading CRLF
                    if self.buf.starts_with(&self.delimiter[2..]) {
                        self.buf.advance(self.delimiter.len() - 2);
                        self.state = State::AfterDelimiter;
                        continue;
                    }
                    match find(&self.buf, &self.delimiter) {
                        Some(pos) => {
                            self.buf.advance(pos + self.delimiter.len());
                            self.state = State::AfterDelimiter;
                        }
                        None => {
                            let keep = self.delimiter.len().saturating_sub(1);
                            if self.buf.len() > keep {
                                self.buf.advance(self.buf.len() - keep);
                            }
                            return self.need_more();
                        }
                    }
                }

                State::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        return self.need_more();
                    }
                    if self.buf.starts_with(b"--") {
                        self.buf.advance(2);
                        self.state = State::Finished;
                        return Ok(Some(MultipartEvent::Finished));
                    }
                    ensure!(
                        self.buf.starts_with(b"\r\n"),
                        ParseError::invalid_body("garbage after multipart boundary")
                    );
                    self.buf.advance(2);
                    self.state = State::Headers;
                }

                State::Headers => {
                    // a part with no headers starts its data after a bare CRLF
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                        self.state = State::Data;
                        return Ok(Some(MultipartEvent::PartStart(PartHeaders::default())));
                    }
                    match find(&self.buf, b"\r\n\r\n") {
                        Some(pos) => {
                            let block = self.buf.split_to(pos + 4);
                            let headers = parse_part_headers(&block)?;
                            self.state = State::Data;
                            return Ok(Some(MultipartEvent::PartStart(headers)));
                        }
                        None => {
                            ensure!(
                                self.buf.len() <= MAX_PART_HEADER_BYTES,
                                ParseError::invalid_body("multipart part headers too large")
                            );
                            return self.need_more();
                        }
                    }
                }

                State::Data => match find(&self.buf, &self.delimiter) {
                    Some(0) => {
                        self.buf.advance(self.delimiter.len());
                        self.state = State::AfterDelimiter;
                        return Ok(Some(MultipartEvent::PartEnd));
                    }
                    Some(pos) => {
                        let data = self.buf.split_to(pos).freeze();
                        return Ok(Some(MultipartEvent::Data(data)));
                    }
                    None => {
                        // hold back enough bytes to recognize a delimiter split
                        // across the next feed
                        let keep = self.delimiter.len() + 1;
                        if self.buf.len() > keep {
                            let data = self.buf.split_to(self.buf.len() - keep).freeze();
                            return Ok(Some(MultipartEvent::Data(data)));
                        }
                        return self.need_more();
                    }
                },

                State::Finished => return Ok(None),
            }
        }
    }

    fn need_more(&self) -> Result<Option<MultipartEvent>, ParseError> {
        if self.input_done && self.state != State::Finished {
            return Err(ParseError::invalid_body("multipart body ended before closing boundary"));
        }
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses one part's header block, extracting what form handling needs.
fn parse_part_headers(block: &[u8]) -> Result<PartHeaders, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let parsed = match httparse::parse_headers(block, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) => {
            return Err(ParseError::invalid_body("truncated multipart part headers"));
        }
        Err(e) => return Err(ParseError::invalid_body(format!("bad multipart part headers: {e}"))),
    };

    let mut part = PartHeaders::default();
    for field in parsed {
        if field.name.eq_ignore_ascii_case("content-disposition") {
            let value = String::from_utf8_lossy(field.value);
            for param in value.split(';').skip(1) {
                let Some((name, raw)) = param.split_once('=') else { continue };
                let raw = raw.trim();
                let unquoted =
                    raw.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(raw).to_owned();
                match name.trim().to_ascii_lowercase().as_str() {
                    "name" => part.name = Some(unquoted),
                    "filename" => part.filename = Some(unquoted),
                    _ => {}
                }
            }
        } else if field.name.eq_ignore_ascii_case("content-type") {
            part.content_type = Some(String::from_utf8_lossy(field.value).into_owned());
        }
    }
    Ok(part)
}

/// Pulls the `boundary` parameter out of a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<&str> {
    for param in content_type.split(';').skip(1) {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim();
            return Some(value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut MultipartParser) -> Vec<MultipartEvent> {
        let mut events = Vec::new();
        while let Some(event) = parser.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn two_parts_one_file() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"name\"\r\n\r\n\
            alice\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"photo\"; filename=\"p.png\"\r\n\
            Content-Type: image/png\r\n\r\n\
            \x89PNG\x0d\r\n\
            --B--\r\n";

        let mut parser = MultipartParser::new("B").unwrap();
        parser.feed(body);
        parser.input_done();
        let events = drain(&mut parser);

        assert_eq!(
            events[0],
            MultipartEvent::PartStart(PartHeaders {
                name: Some("name".into()),
                filename: None,
                content_type: None
            })
        );
        assert_eq!(events[1], MultipartEvent::Data(Bytes::from_static(b"alice")));
        assert_eq!(events[2], MultipartEvent::PartEnd);
        assert_eq!(
            events[3],
            MultipartEvent::PartStart(PartHeaders {
                name: Some("photo".into()),
                filename: Some("p.png".into()),
                content_type: Some("image/png".into()),
            })
        );
        assert_eq!(events[4], MultipartEvent::Data(Bytes::from_static(b"\x89PNG\x0d")));
        assert_eq!(events[5], MultipartEvent::PartEnd);
        assert_eq!(events[6], MultipartEvent::Finished);
        assert!(parser.is_finished());
    }

    #[test]
    fn boundary_split_across_feeds() {
        let mut parser = MultipartParser::new("boundary77").unwrap();
        let body: &[u8] = b"--boundary77\r\n\r\nhello world\r\n--bound";
        parser.feed(body);

        let mut data = Vec::new();
        let mut saw_start = false;
        while let Some(event) = parser.next_event().unwrap() {
            match event {
                MultipartEvent::PartStart(_) => saw_start = true,
                MultipartEvent::Data(bytes) => data.extend_from_slice(&bytes),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_start);

        parser.feed(b"ary77--\r\n");
        parser.input_done();
        let events = drain(&mut parser);
        for event in events {
            match event {
                MultipartEvent::Data(bytes) => data.extend_from_slice(&bytes),
                MultipartEvent::PartEnd | MultipartEvent::Finished => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(data, b"hello world");
        assert!(parser.is_finished());
    }

    #[test]
    fn preamble_is_skipped() {
        let mut parser = MultipartParser::new("B").unwrap();
        parser.feed(b"this is ignored preamble\r\n--B\r\n\r\ndata\r\n--B--\r\n");
        parser.input_done();
        let events = drain(&mut parser);
        assert_eq!(events[0], MultipartEvent::PartStart(PartHeaders::default()));
        assert_eq!(events[1], MultipartEvent::Data(Bytes::from_static(b"data")));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut parser = MultipartParser::new("B").unwrap();
        parser.feed(b"--B\r\n\r\nunterminated");
        parser.input_done();
        loop {
            match parser.next_event() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected a truncation error"),
                Err(_) => break,
            }
        }
    }

    #[test]
    fn oversized_boundary_is_rejected() {
        let boundary = "b".repeat(MAX_BOUNDARY_LEN + 1);
        assert!(MultipartParser::new(&boundary).is_err());
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(boundary_from_content_type("multipart/form-data; boundary=B"), Some("B"));
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; boundary=\"x y\""),
            Some("x y")
        );
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }
}
